//! Key agreement, per-message encryption, and the self-asserted identity hash.

pub mod crypto;
pub mod identity;
pub mod keys;
