//! Centralized tunables for the mesh engine.
//!
//! Constants are the shipped defaults; [`MeshConfig`] carries them at runtime
//! so tests and the CLI can shrink timers without touching the engine.

use std::time::Duration;

// ── Discovery / Liveness ─────────────────────────────────────────────────────

/// Interval between broadcast HELLO envelopes on the relay.
pub const HELLO_INTERVAL: Duration = Duration::from_secs(5);

/// Gap since the last HELLO (or channel activity) after which a peer is offline.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(15);

/// How often the node actor feeds `Tick` into the engine.
/// Must stay well below [`BATCH_WINDOW`] so batches flush on time.
pub const TICK_INTERVAL: Duration = Duration::from_millis(25);

/// A handshake that has not opened its data channel after this long is
/// torn down and retried through backoff.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

// ── Reconnection backoff ─────────────────────────────────────────────────────

/// Delay before the first reconnection attempt; doubles per consecutive failure.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound on a single reconnection delay.
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Attempts allowed inside [`BACKOFF_WINDOW`] before going quiet until rediscovery.
pub const BACKOFF_MAX_ATTEMPTS: usize = 5;

/// Sliding window over which failed attempts are counted.
pub const BACKOFF_WINDOW: Duration = Duration::from_secs(120);

// ── Routing ──────────────────────────────────────────────────────────────────

/// Chat messages to one peer are held at most this long before a batch is sent.
pub const BATCH_WINDOW: Duration = Duration::from_millis(100);

/// A batch reaching this many messages is flushed immediately.
pub const BATCH_MAX_MESSAGES: usize = 10;

/// Seen message ids older than this are forgotten on trim.
pub const SEEN_HORIZON: Duration = Duration::from_secs(30 * 60);

/// Hard cap on remembered message ids; the oldest go first.
pub const SEEN_MAX_ENTRIES: usize = 50_000;

// ── File transfer ────────────────────────────────────────────────────────────

/// Largest file accepted at the send boundary and on receipt (20 MB).
pub const MAX_FILE_SIZE: u64 = 20 * 1024 * 1024;

/// Initial chunk size (16 KiB).
pub const CHUNK_SIZE_DEFAULT: usize = 16 * 1024;

/// Chunk size floor (4 KiB).
pub const CHUNK_SIZE_MIN: usize = 4 * 1024;

/// Chunk size ceiling (32 KiB).
///
/// A chunk is base64'd into the inner JSON, which is encrypted and base64'd
/// again into the envelope: 32 KiB of file data is ~58 KB on the wire, under
/// the 64 KB receive buffer webrtc-rs allocates per SCTP message.
pub const CHUNK_SIZE_MAX: usize = 32 * 1024;

/// Number of recent speed samples averaged by the chunker.
pub const CHUNK_SPEED_WINDOW: usize = 5;

/// Average throughput (bytes/sec) above which the chunk size grows.
pub const CHUNK_FAST_BPS: f64 = 2.0 * 1024.0 * 1024.0;

/// Average throughput (bytes/sec) below which the chunk size shrinks.
pub const CHUNK_SLOW_BPS: f64 = 256.0 * 1024.0;

/// A chunk whose delivery receipt has not arrived after this long is
/// treated as delivered at a slow rate so the transfer cannot stall.
pub const CHUNK_RECEIPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Completed incoming files stay retrievable this long.
pub const COMPLETED_FILE_GRACE: Duration = Duration::from_secs(120);

/// Incomplete incoming transfers idle this long are dropped.
pub const INCOMING_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

// ── Persistence ──────────────────────────────────────────────────────────────

/// File name of the store-and-forward queue under the data directory.
pub const PENDING_FILE: &str = "pending.json";

/// File name of the persisted identity under the data directory.
pub const IDENTITY_FILE: &str = "identity.json";

// ── Transport ────────────────────────────────────────────────────────────────

/// Label of the single ordered, reliable data channel.
pub const DATA_CHANNEL_LABEL: &str = "mesh";

/// Default STUN server handed to webrtc-rs.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Give up on a relay connect attempt after this long.
pub const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between relay reconnect attempts.
pub const RELAY_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Runtime policy for one engine instance.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub hello_interval: Duration,
    pub liveness_timeout: Duration,
    pub handshake_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_max_attempts: usize,
    pub backoff_window: Duration,
    pub batch_window: Duration,
    pub batch_max_messages: usize,
    pub seen_horizon: Duration,
    pub seen_max_entries: usize,
    pub max_file_size: u64,
    pub chunk_size_default: usize,
    pub chunk_size_min: usize,
    pub chunk_size_max: usize,
    pub chunk_speed_window: usize,
    pub chunk_fast_bps: f64,
    pub chunk_slow_bps: f64,
    pub chunk_receipt_timeout: Duration,
    pub completed_file_grace: Duration,
    pub incoming_stale_after: Duration,
    /// TEST ONLY: replace the derived shared key with a fixed, public key.
    pub fixed_test_key: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            hello_interval: HELLO_INTERVAL,
            liveness_timeout: LIVENESS_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            backoff_base: BACKOFF_BASE,
            backoff_max: BACKOFF_MAX,
            backoff_max_attempts: BACKOFF_MAX_ATTEMPTS,
            backoff_window: BACKOFF_WINDOW,
            batch_window: BATCH_WINDOW,
            batch_max_messages: BATCH_MAX_MESSAGES,
            seen_horizon: SEEN_HORIZON,
            seen_max_entries: SEEN_MAX_ENTRIES,
            max_file_size: MAX_FILE_SIZE,
            chunk_size_default: CHUNK_SIZE_DEFAULT,
            chunk_size_min: CHUNK_SIZE_MIN,
            chunk_size_max: CHUNK_SIZE_MAX,
            chunk_speed_window: CHUNK_SPEED_WINDOW,
            chunk_fast_bps: CHUNK_FAST_BPS,
            chunk_slow_bps: CHUNK_SLOW_BPS,
            chunk_receipt_timeout: CHUNK_RECEIPT_TIMEOUT,
            completed_file_grace: COMPLETED_FILE_GRACE,
            incoming_stale_after: INCOMING_STALE_AFTER,
            fixed_test_key: false,
        }
    }
}
