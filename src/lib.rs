//! Meshdrop: serverless mesh chat and file relay over WebRTC data channels.
//!
//! Peers find each other through a dumb WebSocket signaling relay, then talk
//! over direct data channels. Content is end-to-end encrypted per hop,
//! flooded across the mesh with deduplication, and queued for peers that are
//! not reachable yet.

pub mod core;
pub mod utils;
pub mod workers;
