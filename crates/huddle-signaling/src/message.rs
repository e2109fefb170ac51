//! Wire-level signaling envelope.
//!
//! Every frame in either direction is one JSON object:
//!
//! ```json
//! {"type": "OFFER", "sender": "u1", "name": "Ada", "receiver": "h1", "data": {...}}
//! ```
//!
//! `sender` and `name` are always rewritten by the server before a message
//! leaves it; whatever the client put there is ignored. `data` is opaque.

use serde::{Deserialize, Deserializer, Serialize};

/// Signaling event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Offer,
    Answer,
    IceCandidate,
    UserJoined,
    UserLeft,
    UserRequest,
    UserRequestAccepted,
    UserRequestRejected,
    /// Any type this server does not know. Dropped by the router.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Types relayed verbatim from one participant to another.
    pub fn is_relay(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }
}

/// A signaling message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, deserialize_with = "nullable_string")]
    pub sender: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub receiver: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl SignalMessage {
    /// A server-generated notice about `sender`, with no payload.
    pub fn notice(kind: MessageType, sender: &str, name: &str) -> Self {
        Self {
            kind,
            sender: sender.to_owned(),
            name: name.to_owned(),
            receiver: String::new(),
            data: serde_json::Value::Null,
        }
    }

    /// Address the message to a single participant.
    pub fn to(mut self, receiver: &str) -> Self {
        self.receiver = receiver.to_owned();
        self
    }
}

// Browser clients send `null` for fields they leave blank.
fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
