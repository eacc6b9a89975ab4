//! Persisted local identity: the PeerId is generated once and reused across
//! restarts, the username can change at any time.

use crate::utils::atomic_write::atomic_write;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub peer_id: String,
    pub username: String,
    #[serde(skip)]
    path: PathBuf,
}

impl Identity {
    /// Load `identity.json` at `path`, creating it on first run. A non-empty
    /// `username` overrides (and replaces) the stored one.
    pub fn load_or_create(path: &Path, username: Option<&str>) -> Result<Self> {
        let mut identity = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let mut id: Identity = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            id.path = path.to_path_buf();
            id
        } else {
            let peer_id = Uuid::new_v4().to_string();
            let id = Identity {
                username: format!("peer-{}", &peer_id[..8]),
                peer_id,
                path: path.to_path_buf(),
            };
            info!(event = "identity_created", peer_id = %id.peer_id, "Generated new peer identity");
            id.save()?;
            id
        };

        if let Some(name) = username.map(str::trim).filter(|n| !n.is_empty())
            && name != identity.username
        {
            identity.username = name.to_string();
            identity.save()?;
        }
        Ok(identity)
    }

    pub fn set_username(&mut self, username: &str) -> Result<()> {
        self.username = username.trim().to_string();
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_vec_pretty(self)?;
        atomic_write(&self.path, &content)
    }
}
