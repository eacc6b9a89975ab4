//! One [`ConnectionEntry`] per peer and the signaling state machine around it.
//!
//! The manager never touches a transport. It answers "may I start a
//! handshake", "is this OFFER/ANSWER/ICE acceptable right now" and "does this
//! transport event still belong to the live entry"; the engine turns those
//! answers into actions.

use super::backoff::{Backoff, BackoffPolicy};
use crate::core::peer_registry::PeerStatus;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Generation tag of a connection entry. Transport callbacks carry the id of
/// the entry that spawned them; a mismatch means the entry was replaced while
/// the callback was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// We created the offer and wait for an answer.
    Offering,
    /// We accepted a remote offer and are producing the answer.
    Answering,
    ChannelOpen,
}

#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub peer_id: String,
    pub conn_id: ConnectionId,
    pub state: SignalingState,
    pub local_description_sent: bool,
    pub remote_description_set: bool,
    /// Remote KEY_EXCHANGE processed on this connection. It may arrive
    /// before the local open event; the entry is secure once both happened.
    pub secure: bool,
    /// Local ICE candidates gathered before our description went out.
    pending_local_ice: Vec<String>,
    pub created_at: Instant,
}

impl ConnectionEntry {
    fn new(peer_id: &str, conn_id: ConnectionId, state: SignalingState, now: Instant) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            conn_id,
            state,
            local_description_sent: false,
            remote_description_set: state == SignalingState::Answering,
            secure: false,
            pending_local_ice: Vec::new(),
            created_at: now,
        }
    }
}

/// Outcome of an incoming OFFER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferDecision {
    /// Answer on `conn_id`. `replaced` is our own offer we abandoned (glare).
    Accept {
        conn_id: ConnectionId,
        replaced: Option<ConnectionId>,
    },
    Ignore,
}

pub struct ConnectionManager {
    entries: HashMap<String, ConnectionEntry>,
    backoff: HashMap<String, Backoff>,
    policy: BackoffPolicy,
    next_id: u64,
}

impl ConnectionManager {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            backoff: HashMap::new(),
            policy,
            next_id: 1,
        }
    }

    fn allocate(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        id
    }

    /// `true` when `conn_id` is the live entry for `peer_id`.
    pub fn matches(&self, peer_id: &str, conn_id: ConnectionId) -> bool {
        self.entries
            .get(peer_id)
            .is_some_and(|e| e.conn_id == conn_id)
    }

    pub fn is_open(&self, peer_id: &str) -> bool {
        self.entries
            .get(peer_id)
            .is_some_and(|e| e.state == SignalingState::ChannelOpen)
    }

    pub fn open_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.state == SignalingState::ChannelOpen)
            .map(|e| e.peer_id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// No entry and not held back by backoff.
    pub fn can_initiate(&mut self, peer_id: &str, now: Instant) -> bool {
        if self.entries.contains_key(peer_id) {
            return false;
        }
        match self.backoff.get_mut(peer_id) {
            Some(b) => !b.blocks(&self.policy, now),
            None => true,
        }
    }

    /// Create an `Offering` entry. Callers check [`Self::can_initiate`] first.
    pub fn begin_offer(&mut self, peer_id: &str, now: Instant) -> ConnectionId {
        let conn_id = self.allocate();
        self.entries.insert(
            peer_id.to_string(),
            ConnectionEntry::new(peer_id, conn_id, SignalingState::Offering, now),
        );
        conn_id
    }

    /// First offer wins, except under glare: if we are still waiting for an
    /// answer to our own offer, the side with the greater id yields.
    pub fn on_remote_offer(&mut self, peer_id: &str, local_id: &str, now: Instant) -> OfferDecision {
        let replaced = match self.entries.get(peer_id) {
            None => None,
            Some(e)
                if e.state == SignalingState::Offering
                    && !e.remote_description_set
                    && local_id > peer_id =>
            {
                debug!(
                    event = "glare_yield",
                    peer = %peer_id,
                    conn = %e.conn_id,
                    "Both sides offered; yielding to remote offer"
                );
                Some(e.conn_id)
            }
            Some(e) => {
                debug!(
                    event = "offer_ignored",
                    peer = %peer_id,
                    state = ?e.state,
                    "Offer ignored, connection already in progress"
                );
                return OfferDecision::Ignore;
            }
        };

        let conn_id = self.allocate();
        self.entries.insert(
            peer_id.to_string(),
            ConnectionEntry::new(peer_id, conn_id, SignalingState::Answering, now),
        );
        OfferDecision::Accept { conn_id, replaced }
    }

    /// An ANSWER is applied only to our own sent, unanswered offer.
    pub fn on_remote_answer(&mut self, peer_id: &str) -> Option<ConnectionId> {
        let entry = self.entries.get_mut(peer_id)?;
        if entry.state != SignalingState::Offering
            || !entry.local_description_sent
            || entry.remote_description_set
        {
            return None;
        }
        entry.remote_description_set = true;
        Some(entry.conn_id)
    }

    /// ICE is applied only once the remote description is in place.
    pub fn on_remote_ice(&self, peer_id: &str) -> Option<ConnectionId> {
        self.entries
            .get(peer_id)
            .filter(|e| e.remote_description_set)
            .map(|e| e.conn_id)
    }

    /// Mark the local description as sent. Returns the state it was produced
    /// in (OFFER or ANSWER) and any candidates held back until now.
    pub fn on_local_description(
        &mut self,
        peer_id: &str,
        conn_id: ConnectionId,
    ) -> Option<(SignalingState, Vec<String>)> {
        let entry = self.entries.get_mut(peer_id)?;
        if entry.conn_id != conn_id || entry.local_description_sent {
            return None;
        }
        entry.local_description_sent = true;
        Some((entry.state, std::mem::take(&mut entry.pending_local_ice)))
    }

    /// A candidate may only follow our description on the relay; earlier
    /// ones are held and released by [`Self::on_local_description`].
    pub fn on_local_ice(
        &mut self,
        peer_id: &str,
        conn_id: ConnectionId,
        candidate: String,
    ) -> Option<String> {
        let entry = self.entries.get_mut(peer_id)?;
        if entry.conn_id != conn_id {
            return None;
        }
        if entry.local_description_sent {
            return Some(candidate);
        }
        entry.pending_local_ice.push(candidate);
        None
    }

    /// Remote key arrived on this connection. Returns `true` when the channel
    /// is already open, so traffic may now be encrypted.
    pub fn mark_secure(&mut self, peer_id: &str) -> bool {
        match self.entries.get_mut(peer_id) {
            Some(e) => {
                e.secure = true;
                e.state == SignalingState::ChannelOpen
            }
            None => false,
        }
    }

    pub fn is_secure(&self, peer_id: &str) -> bool {
        self.entries
            .get(peer_id)
            .is_some_and(|e| e.state == SignalingState::ChannelOpen && e.secure)
    }

    pub fn conn_id(&self, peer_id: &str) -> Option<ConnectionId> {
        self.entries.get(peer_id).map(|e| e.conn_id)
    }

    /// Channel came up: entry is open and the peer's backoff is cleared.
    pub fn on_channel_open(&mut self, peer_id: &str, conn_id: ConnectionId) -> bool {
        let Some(entry) = self.entries.get_mut(peer_id) else {
            return false;
        };
        if entry.conn_id != conn_id {
            return false;
        }
        entry.state = SignalingState::ChannelOpen;
        if let Some(b) = self.backoff.get_mut(peer_id) {
            b.reset();
        }
        true
    }

    /// Channel closed or transport failed. Removes the entry and returns the
    /// reconnect delay (`Some(None)` when the attempt budget is spent), or
    /// `None` if the event was for a stale connection.
    pub fn on_channel_closed(
        &mut self,
        peer_id: &str,
        conn_id: ConnectionId,
        now: Instant,
    ) -> Option<Option<Duration>> {
        if !self.matches(peer_id, conn_id) {
            return None;
        }
        self.entries.remove(peer_id);
        let delay = self
            .backoff
            .entry(peer_id.to_string())
            .or_default()
            .record_failure(&self.policy, now);
        Some(delay)
    }

    /// Reconnect timer fired; `true` when a fresh offer should be made.
    pub fn on_reconnect_due(&mut self, peer_id: &str, now: Instant) -> bool {
        self.can_initiate(peer_id, now)
    }

    /// Handshakes that did not reach `ChannelOpen` within `timeout`.
    pub fn expired_handshakes(&self, now: Instant, timeout: Duration) -> Vec<(String, ConnectionId)> {
        let mut expired: Vec<(String, ConnectionId)> = self
            .entries
            .values()
            .filter(|e| e.state != SignalingState::ChannelOpen)
            .filter(|e| now.saturating_duration_since(e.created_at) >= timeout)
            .map(|e| (e.peer_id.clone(), e.conn_id))
            .collect();
        expired.sort();
        expired
    }

    /// Drop the entry without touching backoff; returns the closed id.
    pub fn close(&mut self, peer_id: &str) -> Option<ConnectionId> {
        self.entries.remove(peer_id).map(|e| e.conn_id)
    }

    pub fn status(&self, peer_id: &str, now: Instant) -> Option<PeerStatus> {
        if let Some(e) = self.entries.get(peer_id) {
            return Some(match e.state {
                SignalingState::ChannelOpen => PeerStatus::Connected,
                _ => PeerStatus::Connecting,
            });
        }
        self.backoff
            .get(peer_id)
            .filter(|b| b.is_waiting(now))
            .map(|_| PeerStatus::Backoff)
    }

    pub fn failures(&self, peer_id: &str) -> u32 {
        self.backoff.get(peer_id).map_or(0, Backoff::failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 5,
            window: Duration::from_secs(120),
        })
    }

    #[test]
    fn test_offer_lifecycle() {
        let mut m = manager();
        let now = Instant::now();
        assert!(m.can_initiate("b", now));
        let c = m.begin_offer("b", now);
        assert!(!m.can_initiate("b", now));

        assert_eq!(m.on_remote_answer("b"), None, "answer before offer sent");
        assert_eq!(m.on_remote_ice("b"), None);
        assert_eq!(m.on_local_ice("b", c, "early".into()), None);
        assert_eq!(
            m.on_local_description("b", c),
            Some((SignalingState::Offering, vec!["early".to_string()]))
        );
        assert_eq!(m.on_local_ice("b", c, "late".into()), Some("late".to_string()));
        assert_eq!(m.on_local_description("b", c), None);
        assert_eq!(m.on_remote_answer("b"), Some(c));
        assert_eq!(m.on_remote_answer("b"), None, "second answer dropped");
        assert_eq!(m.on_remote_ice("b"), Some(c));

        assert!(!m.mark_secure("x"));
        assert!(m.on_channel_open("b", c));
        assert!(m.is_open("b"));
        assert!(!m.is_secure("b"));
        assert!(m.mark_secure("b"));
        assert!(m.is_secure("b"));
        assert_eq!(m.status("b", now), Some(PeerStatus::Connected));
    }

    #[test]
    fn test_key_before_open_event() {
        let mut m = manager();
        let now = Instant::now();
        let c = match m.on_remote_offer("b", "a", now) {
            OfferDecision::Accept { conn_id, .. } => conn_id,
            OfferDecision::Ignore => panic!("first offer must be accepted"),
        };
        assert!(!m.mark_secure("b"), "not open yet");
        assert!(!m.is_secure("b"));
        assert!(m.on_channel_open("b", c));
        assert!(m.is_secure("b"));
    }

    #[test]
    fn test_unfinished_handshakes_expire() {
        let mut m = manager();
        let t0 = Instant::now();
        let timeout = Duration::from_secs(20);
        let offering = m.begin_offer("b", t0);
        let open = m.begin_offer("c", t0);
        assert!(m.on_channel_open("c", open));

        assert!(m.expired_handshakes(t0 + Duration::from_secs(19), timeout).is_empty());
        assert_eq!(
            m.expired_handshakes(t0 + timeout, timeout),
            vec![("b".to_string(), offering)]
        );
        assert_eq!(
            m.on_channel_closed("b", offering, t0 + timeout),
            Some(Some(Duration::from_secs(1)))
        );
        assert!(m.expired_handshakes(t0 + timeout, timeout).is_empty());
    }

    #[test]
    fn test_first_offer_wins_when_answering() {
        let mut m = manager();
        let now = Instant::now();
        let d = m.on_remote_offer("b", "a", now);
        assert!(matches!(d, OfferDecision::Accept { replaced: None, .. }));
        assert_eq!(m.on_remote_offer("b", "a", now), OfferDecision::Ignore);
    }

    #[test]
    fn test_glare_greater_id_yields() {
        let now = Instant::now();

        let mut high = manager();
        let mine = high.begin_offer("a", now);
        match high.on_remote_offer("a", "z", now) {
            OfferDecision::Accept { conn_id, replaced } => {
                assert_eq!(replaced, Some(mine));
                assert_ne!(conn_id, mine);
            }
            OfferDecision::Ignore => panic!("greater id must yield"),
        }

        let mut low = manager();
        low.begin_offer("z", now);
        assert_eq!(low.on_remote_offer("z", "a", now), OfferDecision::Ignore);
    }

    #[test]
    fn test_stale_connection_events_ignored() {
        let mut m = manager();
        let now = Instant::now();
        let old = m.begin_offer("b", now);
        m.close("b");
        let new = m.begin_offer("b", now);
        assert!(!m.on_channel_open("b", old));
        assert_eq!(m.on_channel_closed("b", old, now), None);
        assert!(m.matches("b", new));
    }

    #[test]
    fn test_close_schedules_backoff_and_open_resets() {
        let mut m = manager();
        let t0 = Instant::now();
        let c = m.begin_offer("b", t0);
        assert_eq!(
            m.on_channel_closed("b", c, t0),
            Some(Some(Duration::from_secs(1)))
        );
        assert_eq!(m.status("b", t0), Some(PeerStatus::Backoff));
        assert!(!m.can_initiate("b", t0));
        assert!(!m.on_reconnect_due("b", t0 + Duration::from_millis(999)));
        assert!(m.on_reconnect_due("b", t0 + Duration::from_secs(1)));

        let t1 = t0 + Duration::from_secs(1);
        let c = m.begin_offer("b", t1);
        assert_eq!(
            m.on_channel_closed("b", c, t1),
            Some(Some(Duration::from_secs(2)))
        );

        let t2 = t1 + Duration::from_secs(2);
        let c = m.begin_offer("b", t2);
        assert!(m.on_channel_open("b", c));
        assert_eq!(m.failures("b"), 0);
    }
}
