//! Write-to-temp-then-rename for every persisted state file.
//!
//! A crash mid-write leaves either the previous file or the new one on disk,
//! never a truncated mix. Parent directories are created on demand.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::error;

/// Sibling temp path used while writing `path` (`pending.json` -> `pending.json.tmp`).
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically replace `path` with `content`.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let tmp = temp_path(path);
    std::fs::write(&tmp, content).map_err(|e| {
        error!(event = "atomic_write_failure", path = %tmp.display(), error = %e, "Failed to write temp file");
        e
    })?;

    if let Err(e) = std::fs::rename(&tmp, path) {
        error!(
            event = "atomic_rename_failure",
            from = %tmp.display(),
            to = %path.display(),
            error = %e,
            "Failed to move temp file into place"
        );
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
