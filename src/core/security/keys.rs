//! Per-peer key material.

use super::crypto::{derive_shared_key, KeyMode, KeyPair, FIXED_TEST_KEY};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// What processing a remote KEY_EXCHANGE did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchangeOutcome {
    /// First shared key for this peer.
    Established,
    /// The peer restarted with a new key pair; key re-derived.
    Rekeyed,
    /// Same public key as before, nothing changed.
    Unchanged,
    /// Public key was not 32 bytes of base64.
    Invalid,
}

/// `{peerId, localKeyPair, sharedKey?, exchanged}`.
///
/// The local key pair is generated once per peer and kept across reconnects,
/// so ciphertext queued before a drop stays readable afterwards.
#[derive(Debug)]
pub struct KeyMaterial {
    pub peer_id: String,
    local: KeyPair,
    remote_public: Option<[u8; 32]>,
    shared_key: Option<[u8; 32]>,
}

impl KeyMaterial {
    pub fn new(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            local: KeyPair::generate(),
            remote_public: None,
            shared_key: None,
        }
    }

    /// Base64 public key for our KEY_EXCHANGE envelope.
    pub fn local_public_b64(&self) -> String {
        STANDARD.encode(self.local.public)
    }

    #[cfg(test)]
    fn exchanged(&self) -> bool {
        self.shared_key.is_some()
    }

    pub fn shared_key(&self) -> Option<&[u8; 32]> {
        self.shared_key.as_ref()
    }

    /// Apply the remote public key. Idempotent for a repeated key.
    pub fn complete(&mut self, remote_b64: &str, local_id: &str, mode: KeyMode) -> KeyExchangeOutcome {
        let Some(remote) = STANDARD
            .decode(remote_b64)
            .ok()
            .and_then(|b| <[u8; 32]>::try_from(b).ok())
        else {
            return KeyExchangeOutcome::Invalid;
        };

        if self.remote_public == Some(remote) && self.shared_key.is_some() {
            return KeyExchangeOutcome::Unchanged;
        }

        let key = match mode {
            KeyMode::Derived => derive_shared_key(&self.local, &remote, local_id, &self.peer_id),
            KeyMode::FixedTestKey => FIXED_TEST_KEY,
        };
        let outcome = if self.shared_key.is_some() {
            KeyExchangeOutcome::Rekeyed
        } else {
            KeyExchangeOutcome::Established
        };
        self.remote_public = Some(remote);
        self.shared_key = Some(key);
        outcome
    }
}
