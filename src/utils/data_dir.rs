//! Process-wide data directory (`~/.meshdrop` unless `--conf` overrides it).
//!
//! Initialized once at startup, before identity or pending queues are loaded.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Resolve and store the data directory.
pub fn init(custom: Option<&Path>) -> Result<&'static Path> {
    let dir = match custom {
        Some(p) => p.to_path_buf(),
        None => dirs::home_dir()
            .ok_or_else(|| anyhow!("no home directory; pass --conf"))?
            .join(".meshdrop"),
    };
    DATA_DIR
        .set(dir)
        .map_err(|_| anyhow!("data directory initialized twice"))?;
    get()
}

/// The data directory chosen by [`init`].
pub fn get() -> Result<&'static Path> {
    DATA_DIR
        .get()
        .map(PathBuf::as_path)
        .ok_or_else(|| anyhow!("data directory not initialized"))
}
