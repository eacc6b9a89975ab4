//! Data-channel envelopes.
//!
//! Outer [`ChannelEnvelope`]s travel in clear on the data channel; everything
//! carrying application content is an `ENCRYPTED` envelope whose ciphertext
//! decodes to an [`InnerMessage`].

use super::base64_bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ChannelEnvelope {
    /// Self-asserted identity; `hash` = SHA3-256(peer_id ++ username).
    Identity {
        peer_id: String,
        username: String,
        hash: String,
    },
    /// Ask the remote side to flush whatever it queued for us.
    SyncRequest,
    /// X25519 public key, base64.
    KeyExchange { public_key: String },
    /// AES-256-GCM sealed [`InnerMessage`]; `from` is the hop sender.
    Encrypted {
        from: String,
        #[serde(with = "base64_bytes")]
        iv: Vec<u8>,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Each element handled as if received on its own.
    MessageBatch { messages: Vec<ChannelEnvelope> },
}

/// One chat line as it travels and as it lands in the message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    /// Originating peer.
    pub from: String,
    /// Unix milliseconds at the origin.
    pub time: i64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum InnerMessage {
    Chat(ChatMessage),
    FileMeta {
        file_id: String,
        name: String,
        size: u64,
        mime: String,
        origin: String,
    },
    FileChunk {
        file_id: String,
        seq: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        origin: String,
    },
    FileEnd {
        file_id: String,
        chunks: u32,
        origin: String,
    },
    MessageBatch { messages: Vec<InnerMessage> },
}

impl InnerMessage {
    /// Identifier recorded in the seen set before delivering or forwarding.
    ///
    /// File control derives one from the file id so every piece is deduplicated
    /// on its own; a batch has none and is unpacked instead.
    pub fn dedup_id(&self) -> Option<String> {
        match self {
            Self::Chat(chat) => Some(chat.id.clone()),
            Self::FileMeta { file_id, .. } => Some(format!("{file_id}:meta")),
            Self::FileChunk { file_id, seq, .. } => Some(format!("{file_id}:chunk:{seq}")),
            Self::FileEnd { file_id, .. } => Some(format!("{file_id}:end")),
            Self::MessageBatch { .. } => None,
        }
    }

    /// Peer that created the message, used to avoid reflecting it back.
    pub fn origin(&self) -> Option<&str> {
        match self {
            Self::Chat(chat) => Some(&chat.from),
            Self::FileMeta { origin, .. }
            | Self::FileChunk { origin, .. }
            | Self::FileEnd { origin, .. } => Some(origin),
            Self::MessageBatch { .. } => None,
        }
    }
}

impl ChannelEnvelope {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypted_wire_shape() {
        let env = ChannelEnvelope::Encrypted {
            from: "a".into(),
            iv: vec![1, 2, 3],
            data: vec![4, 5],
        };
        let v: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "ENCRYPTED");
        assert_eq!(v["iv"], "AQID");
        assert_eq!(v["data"], "BAU=");
    }

    #[test]
    fn test_identity_uses_camel_case_fields() {
        let env = ChannelEnvelope::Identity {
            peer_id: "p".into(),
            username: "u".into(),
            hash: "h".into(),
        };
        let json = env.to_json().unwrap();
        assert!(json.contains("\"peerId\":\"p\""));
        assert!(json.contains("\"type\":\"IDENTITY\""));
    }

    #[test]
    fn test_sync_request_is_bare_tag() {
        assert_eq!(
            ChannelEnvelope::SyncRequest.to_json().unwrap(),
            r#"{"type":"SYNC_REQUEST"}"#
        );
        assert_eq!(
            ChannelEnvelope::from_json(r#"{"type":"SYNC_REQUEST"}"#).unwrap(),
            ChannelEnvelope::SyncRequest
        );
    }

    #[test]
    fn test_chat_inner_parses_flat_fields() {
        let raw = r#"{"type":"CHAT","id":"m1","from":"a","time":5,"text":"hi"}"#;
        let msg: InnerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.dedup_id().as_deref(), Some("m1"));
        assert_eq!(msg.origin(), Some("a"));
    }

    #[test]
    fn test_file_control_dedup_ids_are_distinct() {
        let chunk = |seq| InnerMessage::FileChunk {
            file_id: "f".into(),
            seq,
            data: vec![],
            origin: "a".into(),
        };
        assert_ne!(chunk(0).dedup_id(), chunk(1).dedup_id());
        let end = InnerMessage::FileEnd {
            file_id: "f".into(),
            chunks: 2,
            origin: "a".into(),
        };
        assert_eq!(end.dedup_id().as_deref(), Some("f:end"));
    }

    #[test]
    fn test_unknown_channel_type_is_rejected() {
        assert!(ChannelEnvelope::from_json(r#"{"type":"PING"}"#).is_err());
    }
}
