//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`config.toml` or `--config <path>`)
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::{DEFAULT_STUN_SERVER, MeshConfig};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Meshdrop - decentralized mesh chat and file relay.
#[derive(Parser, Deserialize, Clone, Debug, Default)]
#[command(author, version, about)]
#[command(propagate_version = true)]
#[serde(default)]
pub struct Args {
    /// WebSocket URL of the signaling relay.
    #[clap(long)]
    pub relay: Option<String>,

    /// Display name for this peer. Persisted in identity.json.
    #[clap(long)]
    pub username: Option<String>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    #[serde(skip)]
    pub verbose: u8,

    /// Run the signaling relay on this address (e.g. 0.0.0.0:8787) instead
    /// of a mesh node.
    #[clap(long)]
    pub serve_relay: Option<String>,

    /// TEST ONLY: use a fixed, publicly known channel key.
    #[clap(long)]
    pub fixed_test_key: bool,

    /// STUN server URL; may be given more than once.
    #[clap(long = "stun")]
    pub stun: Vec<String>,

    /// Directory for all persistent data (identity, pending queue, logs).
    /// Defaults to ~/.meshdrop/
    #[clap(long)]
    pub conf: Option<PathBuf>,

    /// TOML file to read defaults from. Defaults to ./config.toml.
    #[clap(long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let mut cli_args = Args::parse();

        // Resolve relative paths to absolute before any working directory change
        cli_args.conf = cli_args.conf.map(Self::resolve_path);

        let path = cli_args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("config.toml"));
        if let Some(file_args) = Self::from_file(&path) {
            return Self::merge(file_args, cli_args);
        }

        cli_args
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Load args from a TOML file.
    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str::<Args>(&content) {
            Ok(args) => Some(args),
            Err(e) => {
                warn!(event = "config_parse_failure", path = %path.display(), error = %e, "Ignoring invalid config file");
                None
            }
        }
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.relay.is_some() {
            file.relay = cli.relay;
        }
        if cli.username.is_some() {
            file.username = cli.username;
        }
        if cli.serve_relay.is_some() {
            file.serve_relay = cli.serve_relay;
        }
        if cli.fixed_test_key {
            file.fixed_test_key = true;
        }
        if !cli.stun.is_empty() {
            file.stun = cli.stun;
        }
        if cli.conf.is_some() {
            file.conf = cli.conf.map(Self::resolve_path);
        } else {
            file.conf = file.conf.map(Self::resolve_path);
        }
        file.verbose = cli.verbose;
        file.config = cli.config;
        file
    }

    /// STUN servers to hand to the transport.
    pub fn stun_servers(&self) -> Vec<String> {
        if self.stun.is_empty() {
            vec![DEFAULT_STUN_SERVER.to_string()]
        } else {
            self.stun.clone()
        }
    }

    /// Engine policy derived from the options.
    pub fn mesh_config(&self) -> MeshConfig {
        MeshConfig {
            fixed_test_key: self.fixed_test_key,
            ..MeshConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_file() {
        let file: Args = toml::from_str(
            r#"
            relay = "ws://file:8787"
            username = "from-file"
            stun = ["stun:file"]
            "#,
        )
        .unwrap();
        let cli = Args::parse_from(["meshdrop", "--username", "cli", "-vv", "--fixed-test-key"]);
        let merged = Args::merge(file, cli);
        assert_eq!(merged.relay.as_deref(), Some("ws://file:8787"));
        assert_eq!(merged.username.as_deref(), Some("cli"));
        assert_eq!(merged.stun, vec!["stun:file".to_string()]);
        assert_eq!(merged.verbose, 2);
        assert!(merged.mesh_config().fixed_test_key);
    }

    #[test]
    fn test_default_stun_server() {
        let args = Args::parse_from(["meshdrop"]);
        assert_eq!(args.stun_servers(), vec![DEFAULT_STUN_SERVER.to_string()]);
        assert!(!args.mesh_config().fixed_test_key);

        let args = Args::parse_from(["meshdrop", "--stun", "stun:a", "--stun", "stun:b"]);
        assert_eq!(args.stun_servers().len(), 2);
    }
}
