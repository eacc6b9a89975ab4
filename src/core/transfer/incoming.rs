//! Receive-side reassembly of flooded file transfers.
//!
//! A transfer opens on FILE_META, accumulates FILE_CHUNKs in arrival order
//! and completes on FILE_END. Chunks over one data channel arrive in order,
//! and the flood path dedups by `(file_id, seq)` upstream, so arrival order
//! is file order.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// `(origin, name, size)`: the same logical file reaching us under two ids
/// is materialized once.
type FileSignature = (String, String, u64);

#[derive(Debug)]
pub struct IncomingFileTransfer {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub origin: String,
    pub received_bytes: u64,
    chunks: Vec<Bytes>,
    result: Option<Bytes>,
    completed_at: Option<Instant>,
    last_activity: Instant,
}

impl IncomingFileTransfer {
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            return if self.completed_at.is_some() { 1.0 } else { 0.0 };
        }
        (self.received_bytes as f64 / self.size as f64).min(1.0)
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    fn signature(&self) -> FileSignature {
        (self.origin.clone(), self.name.clone(), self.size)
    }
}

/// What the application sees for one incoming file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingFileView {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub from: String,
    pub progress: f64,
    pub completed: bool,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaOutcome {
    Opened,
    /// Same id seen before.
    Known,
    /// Same `(origin, name, size)` already materialized under another id.
    Duplicate,
    TooLarge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Accepted { received: u64, size: u64 },
    Unknown,
    Overflow,
    AlreadyComplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndOutcome {
    Completed { size: u64 },
    Unknown,
    AlreadyComplete,
}

pub struct IncomingTransfers {
    transfers: HashMap<String, IncomingFileTransfer>,
    signatures: HashSet<FileSignature>,
    /// Ids rejected as duplicates or oversized; their chunks drop quietly.
    suppressed: HashMap<String, Instant>,
    max_file_size: u64,
    grace: Duration,
    stale_after: Duration,
}

impl IncomingTransfers {
    pub fn new(max_file_size: u64, grace: Duration, stale_after: Duration) -> Self {
        Self {
            transfers: HashMap::new(),
            signatures: HashSet::new(),
            suppressed: HashMap::new(),
            max_file_size,
            grace,
            stale_after,
        }
    }

    pub fn on_meta(
        &mut self,
        file_id: &str,
        name: &str,
        size: u64,
        mime: &str,
        origin: &str,
        now: Instant,
    ) -> MetaOutcome {
        if self.transfers.contains_key(file_id) || self.suppressed.contains_key(file_id) {
            return MetaOutcome::Known;
        }
        if size > self.max_file_size {
            warn!(
                event = "incoming_file_too_large",
                file_id = %file_id,
                size,
                limit = self.max_file_size,
                "Ignoring file metadata over the size limit"
            );
            self.suppressed.insert(file_id.to_string(), now);
            return MetaOutcome::TooLarge;
        }
        let signature = (origin.to_string(), name.to_string(), size);
        if self.signatures.contains(&signature) {
            debug!(
                event = "incoming_file_duplicate",
                file_id = %file_id,
                origin = %origin,
                name = %name,
                "Same file already arriving under another id"
            );
            self.suppressed.insert(file_id.to_string(), now);
            return MetaOutcome::Duplicate;
        }
        self.signatures.insert(signature);
        self.transfers.insert(
            file_id.to_string(),
            IncomingFileTransfer {
                file_id: file_id.to_string(),
                name: name.to_string(),
                size,
                mime: mime.to_string(),
                origin: origin.to_string(),
                received_bytes: 0,
                chunks: Vec::new(),
                result: None,
                completed_at: None,
                last_activity: now,
            },
        );
        info!(event = "incoming_file_opened", file_id = %file_id, name = %name, size, origin = %origin, "Receiving file");
        MetaOutcome::Opened
    }

    pub fn on_chunk(&mut self, file_id: &str, seq: u32, data: Vec<u8>, now: Instant) -> ChunkOutcome {
        let Some(t) = self.transfers.get_mut(file_id) else {
            if !self.suppressed.contains_key(file_id) {
                warn!(event = "chunk_unknown_file", file_id = %file_id, seq, "Chunk for unknown file id ignored");
            }
            return ChunkOutcome::Unknown;
        };
        if t.is_completed() {
            return ChunkOutcome::AlreadyComplete;
        }
        let len = data.len() as u64;
        if t.received_bytes + len > t.size {
            warn!(
                event = "chunk_overflow",
                file_id = %file_id,
                seq,
                received = t.received_bytes,
                declared = t.size,
                "Chunk would exceed declared size, dropped"
            );
            return ChunkOutcome::Overflow;
        }
        t.received_bytes += len;
        t.chunks.push(Bytes::from(data));
        t.last_activity = now;
        ChunkOutcome::Accepted {
            received: t.received_bytes,
            size: t.size,
        }
    }

    pub fn on_end(&mut self, file_id: &str, chunks: u32, now: Instant) -> EndOutcome {
        let Some(t) = self.transfers.get_mut(file_id) else {
            if !self.suppressed.contains_key(file_id) {
                warn!(event = "end_unknown_file", file_id = %file_id, "End marker for unknown file id ignored");
            }
            return EndOutcome::Unknown;
        };
        if t.is_completed() {
            return EndOutcome::AlreadyComplete;
        }
        if t.received_bytes != t.size || t.chunks.len() != chunks as usize {
            warn!(
                event = "incoming_file_short",
                file_id = %file_id,
                received = t.received_bytes,
                declared = t.size,
                chunks_received = t.chunks.len(),
                chunks_declared = chunks,
                "File ended with a size or chunk count mismatch"
            );
        }
        let mut assembled = BytesMut::with_capacity(t.received_bytes as usize);
        for chunk in t.chunks.drain(..) {
            assembled.extend_from_slice(&chunk);
        }
        t.result = Some(assembled.freeze());
        t.completed_at = Some(now);
        t.last_activity = now;
        info!(event = "incoming_file_completed", file_id = %file_id, name = %t.name, bytes = t.received_bytes, "File received");
        EndOutcome::Completed {
            size: t.received_bytes,
        }
    }

    pub fn get(&self, file_id: &str) -> Option<&IncomingFileTransfer> {
        self.transfers.get(file_id)
    }

    /// Hand the assembled bytes to the caller. The record stays until its
    /// grace period ends so flooded duplicates are still recognised.
    pub fn take(&mut self, file_id: &str) -> Option<Bytes> {
        self.transfers.get_mut(file_id)?.result.take()
    }

    pub fn views(&self) -> Vec<IncomingFileView> {
        let mut views: Vec<_> = self
            .transfers
            .values()
            .map(|t| IncomingFileView {
                file_id: t.file_id.clone(),
                name: t.name.clone(),
                size: t.size,
                mime: t.mime.clone(),
                from: t.origin.clone(),
                progress: t.progress(),
                completed: t.is_completed(),
                available: t.result.is_some(),
            })
            .collect();
        views.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        views
    }

    /// Release completed files past their grace period and abandon
    /// incomplete ones that stopped receiving chunks. Returns removed ids.
    pub fn gc(&mut self, now: Instant) -> Vec<String> {
        let (grace, stale_after) = (self.grace, self.stale_after);
        let expired: Vec<String> = self
            .transfers
            .values()
            .filter(|t| match t.completed_at {
                Some(done) => now.saturating_duration_since(done) >= grace,
                None => now.saturating_duration_since(t.last_activity) >= stale_after,
            })
            .map(|t| t.file_id.clone())
            .collect();

        for id in &expired {
            if let Some(t) = self.transfers.remove(id) {
                if !t.is_completed() {
                    warn!(
                        event = "incoming_file_abandoned",
                        file_id = %id,
                        received = t.received_bytes,
                        declared = t.size,
                        "Dropping stalled incoming transfer"
                    );
                }
                self.signatures.remove(&t.signature());
            }
        }
        self.suppressed
            .retain(|_, at| now.saturating_duration_since(*at) < stale_after);
        expired
    }
}
