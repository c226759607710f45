//! Shared identifiers, message contracts and the bus envelope.

mod envelope;
pub mod headers;
mod message;
mod types;

pub use envelope::{MessageEnvelope, MessageEnvelopeBuilder};
pub use headers::Headers;
pub use message::{Command, Event, Message, MessageKind, Response};
pub use types::{CorrelationId, MessageId, SagaId};
