//! Wire types: relay signaling envelopes and data-channel envelopes.
//!
//! Pure data, no I/O. Every tag is a closed enum so unknown `type` values
//! fail deserialization and are handled as protocol desync by the engine.

pub mod channel;
pub mod signaling;

pub use channel::{ChannelEnvelope, ChatMessage, InnerMessage};
pub use signaling::{SignalBody, SignalingEnvelope};

/// Serde helper: `Vec<u8>` as a standard base64 string rather than a JSON
/// array of numbers.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
