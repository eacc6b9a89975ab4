//! Per-peer connection lifecycle: signaling state machine, reconnection
//! backoff, and the webrtc-rs transport that carries the data channel.

pub mod backoff;
pub mod manager;
pub mod webrtc;

pub use backoff::{Backoff, BackoffPolicy};
pub use manager::{ConnectionEntry, ConnectionId, ConnectionManager, OfferDecision, SignalingState};
