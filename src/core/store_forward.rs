//! Store-and-forward queue for peers without a secure channel.
//!
//! One ordered queue per peer. Entries leave the queue only when the engine
//! takes them for a flush; a send that fails afterwards comes back as a
//! sealed entry. The whole table is persisted as `pending.json` under the
//! data directory so queued traffic survives a restart.

use crate::core::protocol::InnerMessage;
use crate::utils::atomic_write::atomic_write;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingEntry {
    /// Queued before any key existed; encrypted when flushed.
    Plain { message: InnerMessage },
    /// A complete ENCRYPTED envelope that failed to send; replayed as-is.
    Sealed { payload: String },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PendingFile {
    #[serde(default)]
    peers: BTreeMap<String, VecDeque<PendingEntry>>,
}

#[derive(Debug, Default)]
pub struct PendingQueues {
    queues: BTreeMap<String, VecDeque<PendingEntry>>,
    path: Option<PathBuf>,
    dirty: bool,
}

impl PendingQueues {
    /// Queues that are never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing file is an empty table.
    pub fn load(path: &Path) -> Result<Self> {
        let mut queues = Self {
            path: Some(path.to_path_buf()),
            ..Self::default()
        };
        if !path.exists() {
            return Ok(queues);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: PendingFile = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        queues.queues = file.peers;
        queues.queues.retain(|_, q| !q.is_empty());
        let total = queues.total_len();
        if total > 0 {
            info!(
                event = "pending_loaded",
                peers = queues.queues.len(),
                entries = total,
                "Restored store-and-forward queue"
            );
        }
        Ok(queues)
    }

    pub fn enqueue(&mut self, peer_id: &str, entry: PendingEntry) {
        self.queues
            .entry(peer_id.to_string())
            .or_default()
            .push_back(entry);
        self.dirty = true;
        debug!(
            event = "pending_enqueued",
            peer = %peer_id,
            depth = self.len(peer_id),
            "Queued message for unreachable peer"
        );
    }

    /// Remove and return everything queued for `peer_id`, oldest first.
    pub fn take(&mut self, peer_id: &str) -> Vec<PendingEntry> {
        match self.queues.remove(peer_id) {
            Some(q) => {
                self.dirty = true;
                q.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn len(&self, peer_id: &str) -> usize {
        self.queues.get(peer_id).map_or(0, VecDeque::len)
    }

    pub fn total_len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Persist if anything changed since the last save.
    pub fn save_if_dirty(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(path) = &self.path {
            let file = PendingFile {
                peers: self.queues.clone(),
            };
            let content = serde_json::to_vec_pretty(&file)?;
            atomic_write(path, &content)?;
        }
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::ChatMessage;

    fn chat(id: &str) -> PendingEntry {
        PendingEntry::Plain {
            message: InnerMessage::Chat(ChatMessage {
                id: id.into(),
                from: "a".into(),
                time: 1,
                text: format!("msg {id}"),
            }),
        }
    }

    #[test]
    fn test_take_preserves_order_and_clears() {
        let mut q = PendingQueues::in_memory();
        q.enqueue("b", chat("1"));
        q.enqueue("b", PendingEntry::Sealed {
            payload: "{}".into(),
        });
        q.enqueue("b", chat("3"));
        q.enqueue("c", chat("x"));
        assert_eq!(q.len("b"), 3);

        let taken = q.take("b");
        assert_eq!(taken.len(), 3);
        assert_eq!(taken[0], chat("1"));
        assert_eq!(taken[2], chat("3"));
        assert_eq!(q.len("b"), 0);
        assert_eq!(q.total_len(), 1);
        assert!(q.take("b").is_empty());
    }

    #[test]
    fn test_persist_and_reload() {
        let path = std::env::temp_dir().join(format!("meshdrop-pending-{}.json", uuid::Uuid::new_v4()));
        let mut q = PendingQueues::load(&path).unwrap();
        q.enqueue("b", chat("1"));
        q.enqueue("b", chat("2"));
        assert!(q.is_dirty());
        q.save_if_dirty().unwrap();
        assert!(!q.is_dirty());

        let mut reloaded = PendingQueues::load(&path).unwrap();
        assert_eq!(reloaded.len("b"), 2);
        assert_eq!(reloaded.take("b"), vec![chat("1"), chat("2")]);
        reloaded.save_if_dirty().unwrap();

        let empty = PendingQueues::load(&path).unwrap();
        assert_eq!(empty.total_len(), 0);
        let _ = std::fs::remove_file(&path);
    }
}
