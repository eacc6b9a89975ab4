//! HMAC-SHA3-256, a two-step HKDF built on it, and constant-time comparison.
//!
//! Every keyed hash in the crate goes through here: shared-key derivation in
//! `core::security::crypto` and digest comparison in `core::security::identity`.

use sha3::{Digest, Sha3_256};

/// SHA3-256 rate in bytes (1088 bits), the HMAC block size.
const BLOCK_SIZE: usize = 136;

/// HMAC-SHA3-256 per RFC 2104.
pub fn hmac_sha3_256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        block[..32].copy_from_slice(&Sha3_256::digest(key));
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let mut ipad = [0x36u8; BLOCK_SIZE];
    let mut opad = [0x5cu8; BLOCK_SIZE];
    for (i, b) in block.iter().enumerate() {
        ipad[i] ^= b;
        opad[i] ^= b;
    }

    let inner = Sha3_256::new().chain_update(ipad).chain_update(data).finalize();
    let outer = Sha3_256::new().chain_update(opad).chain_update(inner).finalize();
    outer.into()
}

/// HKDF extract-then-expand producing a single 32-byte output block.
pub fn hkdf_sha3_256(ikm: &[u8], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let prk = hmac_sha3_256(salt, ikm);
    let mut expand = Vec::with_capacity(info.len() + 1);
    expand.extend_from_slice(info);
    expand.push(0x01);
    hmac_sha3_256(&prk, &expand)
}

/// Compare two byte strings without early exit on the first mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
