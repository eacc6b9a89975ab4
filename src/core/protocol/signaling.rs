//! Relay envelope: `{type, from, to?, data}`.
//!
//! The relay routes on `to` (absent means broadcast) and never looks inside
//! `data`. Session descriptions and ICE candidates travel as the JSON strings
//! webrtc-rs produces for them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(flatten)]
    pub body: SignalBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "UPPERCASE")]
pub enum SignalBody {
    /// Discovery / keepalive broadcast.
    Hello(Hello),
    /// Serialized `RTCSessionDescription` of type offer.
    Offer(String),
    /// Serialized `RTCSessionDescription` of type answer.
    Answer(String),
    /// Serialized `RTCIceCandidateInit`.
    Ice(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl SignalingEnvelope {
    pub fn broadcast(from: &str, body: SignalBody) -> Self {
        Self {
            from: from.to_string(),
            to: None,
            body,
        }
    }

    pub fn direct(from: &str, to: &str, body: SignalBody) -> Self {
        Self {
            from: from.to_string(),
            to: Some(to.to_string()),
            body,
        }
    }

    /// Whether a node with id `local_id` should act on this envelope.
    pub fn is_for(&self, local_id: &str) -> bool {
        self.from != local_id && self.to.as_deref().is_none_or(|to| to == local_id)
    }

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
    fn test_offer_wire_shape() {
        let env = SignalingEnvelope::direct("a", "b", SignalBody::Offer("{\"sdp\":\"x\"}".into()));
        let v: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "OFFER");
        assert_eq!(v["from"], "a");
        assert_eq!(v["to"], "b");
        assert_eq!(v["data"], "{\"sdp\":\"x\"}");
    }

    #[test]
    fn test_broadcast_omits_to() {
        let env = SignalingEnvelope::broadcast(
            "a",
            SignalBody::Hello(Hello {
                username: Some("alice".into()),
            }),
        );
        let json = env.to_json().unwrap();
        assert!(!json.contains("\"to\""));
        let back = SignalingEnvelope::from_json(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_is_for_filters_own_and_foreign_envelopes() {
        let hello = SignalBody::Hello(Hello::default());
        assert!(SignalingEnvelope::broadcast("b", hello.clone()).is_for("a"));
        assert!(!SignalingEnvelope::broadcast("a", hello.clone()).is_for("a"));
        assert!(SignalingEnvelope::direct("b", "a", hello.clone()).is_for("a"));
        assert!(!SignalingEnvelope::direct("b", "c", hello).is_for("a"));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let raw = r#"{"type":"BYE","from":"a","data":null}"#;
        assert!(SignalingEnvelope::from_json(raw).is_err());
    }
}
