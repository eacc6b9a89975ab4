//! Every peer this node has heard of, with liveness and claimed username.
//!
//! Records are never removed: an offline peer drops out of routing but stays
//! in the history so it keeps its username when it comes back.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::info;

/// Connectivity as shown to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    /// Heard on the relay, no connection attempt running.
    Discovered,
    /// Signaling handshake in progress.
    Connecting,
    /// Data channel open.
    Connected,
    /// Last attempt failed; waiting out the backoff delay.
    Backoff,
    /// Liveness timeout expired.
    Offline,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: String,
    pub last_seen_at: Instant,
    /// Only set from a verified IDENTITY or a HELLO before any IDENTITY arrived.
    pub username: Option<String>,
    /// Whether the username came from a verified IDENTITY announcement.
    pub username_verified: bool,
    /// Last IDENTITY failed its hash check; HELLO hints are ignored until a
    /// valid one arrives.
    pub identity_rejected: bool,
    pub online: bool,
}

/// Read-model row handed to the application layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerView {
    pub peer_id: String,
    pub username: Option<String>,
    pub status: PeerStatus,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<String, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a liveness signal. Returns `true` when the peer is new or was
    /// offline, i.e. the peer list changed.
    pub fn touch(&mut self, peer_id: &str, now: Instant) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(record) => {
                record.last_seen_at = now;
                let came_back = !record.online;
                record.online = true;
                if came_back {
                    info!(event = "peer_back_online", peer = %peer_id, "Peer is back online");
                }
                came_back
            }
            None => {
                info!(event = "peer_discovered", peer = %peer_id, "New peer discovered");
                self.peers.insert(
                    peer_id.to_string(),
                    PeerRecord {
                        peer_id: peer_id.to_string(),
                        last_seen_at: now,
                        username: None,
                        username_verified: false,
                        identity_rejected: false,
                        online: true,
                    },
                );
                true
            }
        }
    }

    /// Username carried by a HELLO. Never overrides a verified one.
    pub fn hint_username(&mut self, peer_id: &str, username: &str) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(record)
                if !record.username_verified
                    && !record.identity_rejected
                    && record.username.as_deref() != Some(username) =>
            {
                record.username = Some(username.to_string());
                true
            }
            _ => false,
        }
    }

    /// Username from an IDENTITY whose hash checked out.
    pub fn set_verified_username(&mut self, peer_id: &str, username: &str) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(record) => {
                let changed = record.username.as_deref() != Some(username) || !record.username_verified;
                record.username = Some(username.to_string());
                record.username_verified = true;
                record.identity_rejected = false;
                changed
            }
            None => false,
        }
    }

    /// IDENTITY hash mismatch: forget whatever username we were showing.
    pub fn reject_identity(&mut self, peer_id: &str) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(record) => {
                let changed = record.username.is_some();
                record.username = None;
                record.username_verified = false;
                record.identity_rejected = true;
                changed
            }
            None => false,
        }
    }

    /// Peers whose last signal is older than `timeout` and still marked online.
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<String> {
        self.peers
            .values()
            .filter(|r| r.online && now.saturating_duration_since(r.last_seen_at) > timeout)
            .map(|r| r.peer_id.clone())
            .collect()
    }

    pub fn mark_offline(&mut self, peer_id: &str) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(record) if record.online => {
                record.online = false;
                info!(event = "peer_offline", peer = %peer_id, "Peer liveness timed out");
                true
            }
            _ => false,
        }
    }

    pub fn is_online(&self, peer_id: &str) -> bool {
        self.peers.get(peer_id).is_some_and(|r| r.online)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// Ids of peers currently taking part in routing, sorted.
    pub fn online_peers(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|r| r.online)
            .map(|r| r.peer_id.clone())
            .collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }
}
