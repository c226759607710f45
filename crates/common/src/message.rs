//! Typed message contracts.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// The delivery style of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Point-to-point instruction to a single service.
    Command,
    /// Broadcast fact that any number of services may react to.
    Event,
    /// Success or failure answer to a previously sent message.
    Response,
}

impl MessageKind {
    /// Returns the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "Command",
            MessageKind::Event => "Event",
            MessageKind::Response => "Response",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A message body that can travel inside a [`MessageEnvelope`](crate::MessageEnvelope).
///
/// `MESSAGE_TYPE` is the stable wire name. It is what the handler registry,
/// the step log and the compensation coordinator use to find the Rust type
/// again, so it must not change once messages have been recorded.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type name used for routing and persisted step records.
    const MESSAGE_TYPE: &'static str;

    /// Delivery style of this message.
    const KIND: MessageKind;
}

/// Marker for point-to-point messages.
pub trait Command: Message {}

/// Marker for broadcast messages.
pub trait Event: Message {}

/// A response correlated to a previously sent request message.
pub trait Response: Message {
    /// The message type this response answers.
    type Request: Message;

    /// Returns true for a success response, false for a failure response.
    fn is_success(&self) -> bool;
}
