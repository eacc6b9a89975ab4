//! Errors surfaced synchronously to callers of the engine's send commands.
//!
//! Only caller-input problems live here. Connectivity, desync and decryption
//! failures are handled inside the engine and never reach a caller.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("username is empty")]
    EmptyUsername,

    #[error("file is {size} bytes, limit is {limit}")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("unknown peer: {0}")]
    UnknownPeer(String),
}
