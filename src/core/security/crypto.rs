//! Key agreement and per-message encryption.
//!
//! ```text
//! shared_key = HKDF-SHA3-256(
//!     ikm  = X25519(local_secret, remote_public),
//!     salt = sort(peer_id_a, peer_id_b) joined,
//!     info = b"meshdrop-channel-v1"
//! )
//! ```
//!
//! Messages are sealed with AES-256-GCM under a fresh random 96-bit nonce per
//! call. [`KeyMode::FixedTestKey`] swaps the derived key for a constant so
//! captured traffic is reproducible in tests; it is never the default.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Result};
use x25519_dalek::{PublicKey, StaticSecret};

/// Publicly known key used only in [`KeyMode::FixedTestKey`].
pub const FIXED_TEST_KEY: [u8; 32] = *b"meshdrop-fixed-test-key-00000000";

const KDF_INFO: &[u8] = b"meshdrop-channel-v1";

/// Where a peer's shared key comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyMode {
    /// X25519 agreement + HKDF. Production.
    #[default]
    Derived,
    /// TEST ONLY: every channel uses [`FIXED_TEST_KEY`].
    FixedTestKey,
}

/// X25519 key pair generated once per peer connection attempt.
pub struct KeyPair {
    secret: StaticSecret,
    pub public: [u8; 32],
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::from(rand::random::<[u8; 32]>());
        let public = *PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Derive the symmetric key both ends of a channel arrive at.
///
/// Peer ids are sorted into the salt so the result is the same on both sides.
pub fn derive_shared_key(
    local: &KeyPair,
    remote_public: &[u8; 32],
    local_id: &str,
    remote_id: &str,
) -> [u8; 32] {
    let dh = local.secret.diffie_hellman(&PublicKey::from(*remote_public));
    let (lo, hi) = if local_id <= remote_id {
        (local_id, remote_id)
    } else {
        (remote_id, local_id)
    };
    let salt = format!("{lo}|{hi}");
    crate::utils::crypto::hkdf_sha3_256(dh.as_bytes(), salt.as_bytes(), KDF_INFO)
}

/// Nonce plus ciphertext-with-tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub iv: [u8; 12],
    pub ciphertext: Vec<u8>,
}

pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Sealed> {
    let cipher = Aes256Gcm::new(key.into());
    let iv: [u8; 12] = rand::random();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| anyhow!("encryption failed: {e}"))?;
    Ok(Sealed { iv, ciphertext })
}

pub fn decrypt(key: &[u8; 32], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != 12 {
        return Err(anyhow!("nonce must be 12 bytes, got {}", iv.len()));
    }
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|e| anyhow!("decryption failed: {e}"))
}
