//! Sending side of a file transfer.
//!
//! One chunk is in flight at a time. The driver reports when a chunk's send
//! buffer drained; that time becomes a speed sample for the chunker and
//! releases the next chunk.

use super::chunker::AdaptiveChunker;
use bytes::Bytes;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct InFlight {
    seq: u32,
    bytes: usize,
    sent_at: Instant,
}

#[derive(Debug)]
pub struct OutgoingFileTransfer {
    pub file_id: String,
    pub name: String,
    pub mime: String,
    data: Bytes,
    bytes_sent: usize,
    next_seq: u32,
    chunker: AdaptiveChunker,
    in_flight: Option<InFlight>,
}

impl OutgoingFileTransfer {
    pub fn new(file_id: String, name: String, mime: String, data: Bytes, chunker: AdaptiveChunker) -> Self {
        Self {
            file_id,
            name,
            mime,
            data,
            bytes_sent: 0,
            next_seq: 0,
            chunker,
            in_flight: None,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent as u64
    }

    pub fn chunk_size(&self) -> usize {
        self.chunker.chunk_size()
    }

    /// Number of chunks cut so far.
    pub fn chunks_sent(&self) -> u32 {
        self.next_seq
    }

    /// Cut the next chunk, unless one is still awaiting its receipt.
    pub fn next_chunk(&mut self, now: Instant) -> Option<(u32, Bytes)> {
        if self.in_flight.is_some() || self.bytes_sent >= self.data.len() {
            return None;
        }
        let end = (self.bytes_sent + self.chunker.chunk_size()).min(self.data.len());
        let chunk = self.data.slice(self.bytes_sent..end);
        let seq = self.next_seq;
        self.in_flight = Some(InFlight {
            seq,
            bytes: chunk.len(),
            sent_at: now,
        });
        self.bytes_sent = end;
        self.next_seq += 1;
        Some((seq, chunk))
    }

    /// First receipt for the in-flight chunk: sample and release.
    pub fn on_delivered(&mut self, seq: u32, elapsed: Duration) -> bool {
        match self.in_flight {
            Some(f) if f.seq == seq => {
                self.chunker.record(f.bytes, elapsed);
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    /// The chunk went nowhere live (queued or no targets): release without
    /// a sample.
    pub fn release(&mut self, seq: u32) -> bool {
        if self.in_flight.is_some_and(|f| f.seq == seq) {
            self.in_flight = None;
            return true;
        }
        false
    }

    /// Receipt overdue: count it as a slow delivery and move on.
    pub fn check_timeout(&mut self, now: Instant, timeout: Duration) -> bool {
        match self.in_flight {
            Some(f) if now.saturating_duration_since(f.sent_at) >= timeout => {
                self.chunker.record(f.bytes, timeout);
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.in_flight.is_none() && self.bytes_sent >= self.data.len()
    }
}
