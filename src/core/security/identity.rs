//! Self-asserted identity hash.
//!
//! `hash = hex(SHA3-256(peer_id ++ username))`. It only catches a username
//! that was corrupted or mismatched in transit. Anyone choosing both fields
//! can produce a matching hash, so it is not authentication: a malicious peer
//! can claim any id and name it likes.

use sha3::{Digest, Sha3_256};

pub fn compute_identity_hash(peer_id: &str, username: &str) -> String {
    let digest = Sha3_256::new()
        .chain_update(peer_id.as_bytes())
        .chain_update(username.as_bytes())
        .finalize();
    hex::encode(digest)
}

/// Check an announced `(peer_id, username, hash)` triple.
pub fn verify_identity(peer_id: &str, username: &str, hash: &str) -> bool {
    let expected = compute_identity_hash(peer_id, username);
    crate::utils::crypto::constant_time_eq(expected.as_bytes(), hash.as_bytes())
}
