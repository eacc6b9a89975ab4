//! Flood routing primitives: the seen-id set, target selection and the
//! per-peer chat batcher.

use crate::core::protocol::InnerMessage;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

// ── Dedup ────────────────────────────────────────────────────────────────────

/// Message ids already surfaced or forwarded by this node.
///
/// Bounded by age and by count. Forgetting an id re-opens a tiny window for
/// re-delivery after very long idle periods; that risk is accepted.
pub struct SeenMessageSet {
    ids: HashSet<String>,
    order: VecDeque<(String, Instant)>,
    horizon: Duration,
    max_entries: usize,
}

impl SeenMessageSet {
    pub fn new(horizon: Duration, max_entries: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            horizon,
            max_entries,
        }
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: &str, now: Instant) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back((id.to_string(), now));
        if self.order.len() > self.max_entries {
            self.pop_oldest();
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }

    /// Forget ids older than the horizon.
    pub fn trim(&mut self, now: Instant) {
        while self
            .order
            .front()
            .is_some_and(|(_, at)| now.saturating_duration_since(*at) > self.horizon)
        {
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        if let Some((id, _)) = self.order.pop_front() {
            self.ids.remove(&id);
        }
    }
}

/// Every online peer except ourselves, the hop we got it from and its origin.
pub fn flood_targets(
    online: &[String],
    local_id: &str,
    last_hop: Option<&str>,
    origin: Option<&str>,
) -> Vec<String> {
    online
        .iter()
        .filter(|p| {
            p.as_str() != local_id
                && Some(p.as_str()) != last_hop
                && Some(p.as_str()) != origin
        })
        .cloned()
        .collect()
}

// ── Batching ─────────────────────────────────────────────────────────────────

struct PendingBatch {
    messages: Vec<InnerMessage>,
    opened_at: Instant,
}

/// Collects outbound chat per peer for a short window.
pub struct ChatBatcher {
    batches: HashMap<String, PendingBatch>,
    window: Duration,
    max_messages: usize,
}

impl ChatBatcher {
    pub fn new(window: Duration, max_messages: usize) -> Self {
        Self {
            batches: HashMap::new(),
            window,
            max_messages: max_messages.max(1),
        }
    }

    /// Add a message for `peer_id`. A batch that reaches the cap is returned
    /// for immediate sending.
    pub fn push(
        &mut self,
        peer_id: &str,
        message: InnerMessage,
        now: Instant,
    ) -> Option<Vec<InnerMessage>> {
        let batch = self
            .batches
            .entry(peer_id.to_string())
            .or_insert_with(|| PendingBatch {
                messages: Vec::new(),
                opened_at: now,
            });
        batch.messages.push(message);
        if batch.messages.len() >= self.max_messages {
            return self.batches.remove(peer_id).map(|b| b.messages);
        }
        None
    }

    /// Batches whose window has elapsed, in peer order.
    pub fn due(&mut self, now: Instant) -> Vec<(String, Vec<InnerMessage>)> {
        let mut ready: Vec<String> = self
            .batches
            .iter()
            .filter(|(_, b)| now.saturating_duration_since(b.opened_at) >= self.window)
            .map(|(peer, _)| peer.clone())
            .collect();
        ready.sort();
        ready
            .into_iter()
            .filter_map(|peer| {
                let batch = self.batches.remove(&peer)?;
                Some((peer, batch.messages))
            })
            .collect()
    }

    /// Everything still held, regardless of age.
    pub fn drain(&mut self) -> Vec<(String, Vec<InnerMessage>)> {
        let mut all: Vec<_> = self
            .batches
            .drain()
            .map(|(peer, b)| (peer, b.messages))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::ChatMessage;

    fn chat(id: &str) -> InnerMessage {
        InnerMessage::Chat(ChatMessage {
            id: id.into(),
            from: "a".into(),
            time: 0,
            text: "hi".into(),
        })
    }

    #[test]
    fn test_seen_insert_is_idempotent() {
        let mut seen = SeenMessageSet::new(Duration::from_secs(60), 100);
        let now = Instant::now();
        assert!(seen.insert("m1", now));
        assert!(!seen.insert("m1", now));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_seen_trims_by_age_and_count() {
        let mut seen = SeenMessageSet::new(Duration::from_secs(60), 3);
        let t0 = Instant::now();
        seen.insert("old", t0);
        seen.insert("b", t0 + Duration::from_secs(50));
        seen.trim(t0 + Duration::from_secs(61));
        assert!(!seen.contains("old"));
        assert!(seen.contains("b"));

        let t1 = t0 + Duration::from_secs(55);
        seen.insert("c", t1);
        seen.insert("d", t1);
        seen.insert("e", t1);
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains("b"));
    }

    #[test]
    fn test_flood_targets_exclude_hop_origin_and_self() {
        let online: Vec<String> = ["a", "b", "c", "me"].iter().map(|s| s.to_string()).collect();
        let targets = flood_targets(&online, "me", Some("b"), Some("a"));
        assert_eq!(targets, vec!["c".to_string()]);
        let targets = flood_targets(&online, "me", None, None);
        assert_eq!(targets.len(), 3);
    }

    #[test]
    fn test_batch_flushes_on_cap() {
        let mut batcher = ChatBatcher::new(Duration::from_millis(100), 3);
        let now = Instant::now();
        assert!(batcher.push("b", chat("1"), now).is_none());
        assert!(batcher.push("b", chat("2"), now).is_none());
        let full = batcher.push("b", chat("3"), now).unwrap();
        assert_eq!(full.len(), 3);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_batch_flushes_after_window() {
        let mut batcher = ChatBatcher::new(Duration::from_millis(100), 10);
        let t0 = Instant::now();
        batcher.push("b", chat("1"), t0);
        batcher.push("c", chat("2"), t0 + Duration::from_millis(50));
        assert!(batcher.due(t0 + Duration::from_millis(99)).is_empty());
        let due = batcher.due(t0 + Duration::from_millis(100));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, "b");
        let due = batcher.due(t0 + Duration::from_millis(150));
        assert_eq!(due[0].0, "c");
    }
}
