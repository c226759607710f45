//! Message envelope: immutable routing and causation metadata around a payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::Error as _};

use crate::headers::Headers;
use crate::message::{Message, MessageKind};
use crate::types::{CorrelationId, MessageId, SagaId};

/// A message as it travels on the bus.
///
/// The envelope carries causation metadata (`parent_message_id`,
/// `correlation_id`) next to the serialized body so the saga engine can
/// route, track and compensate without decoding the body first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique identifier of this message instance.
    pub message_id: MessageId,

    /// The message that caused this one. `None` for saga roots.
    pub parent_message_id: Option<MessageId>,

    /// Shared by every message of one logical saga execution.
    pub correlation_id: CorrelationId,

    /// When the message was created.
    pub timestamp: DateTime<Utc>,

    /// The service that produced the message.
    pub application_id: String,

    /// The saga this message belongs to, if any.
    pub saga_id: Option<SagaId>,

    /// Wire name of the body type.
    pub message_type: String,

    /// Delivery style of the body.
    pub kind: MessageKind,

    /// The serialized body.
    pub payload: serde_json::Value,

    /// Transport headers (saga id, trace context, content type).
    pub headers: Headers,
}

impl MessageEnvelope {
    /// Creates a new envelope builder.
    pub fn builder() -> MessageEnvelopeBuilder {
        MessageEnvelopeBuilder::default()
    }

    /// Wraps a typed message body as a saga root (no parent, fresh correlation).
    pub fn root<M: Message>(
        message: &M,
        application_id: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::builder()
            .body(message)?
            .application_id(application_id)
            .build())
    }

    /// Decodes the payload into its typed body.
    ///
    /// Fails if the envelope's `message_type` does not match `M`.
    pub fn decode<M: Message>(&self) -> Result<M, serde_json::Error> {
        if self.message_type != M::MESSAGE_TYPE {
            return Err(serde_json::Error::custom(format!(
                "message type mismatch: envelope carries {}, expected {}",
                self.message_type,
                M::MESSAGE_TYPE
            )));
        }
        serde_json::from_value(self.payload.clone())
    }

    /// Returns true if this message has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_message_id.is_none()
    }

    /// Returns a header value, if present.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Builder for constructing message envelopes.
#[derive(Debug, Default)]
pub struct MessageEnvelopeBuilder {
    message_id: Option<MessageId>,
    parent_message_id: Option<MessageId>,
    correlation_id: Option<CorrelationId>,
    timestamp: Option<DateTime<Utc>>,
    application_id: Option<String>,
    saga_id: Option<SagaId>,
    message_type: Option<String>,
    kind: Option<MessageKind>,
    payload: Option<serde_json::Value>,
    headers: Headers,
}

impl MessageEnvelopeBuilder {
    /// Sets the message ID. If not set, a new ID will be generated.
    pub fn message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    /// Sets the causing message.
    pub fn parent_message_id(mut self, id: MessageId) -> Self {
        self.parent_message_id = Some(id);
        self
    }

    /// Sets the correlation ID. Defaults to the message ID.
    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the originating service.
    pub fn application_id(mut self, application_id: impl Into<String>) -> Self {
        self.application_id = Some(application_id.into());
        self
    }

    /// Sets the saga ID.
    pub fn saga_id(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    /// Sets the message type and kind explicitly.
    pub fn message_type(mut self, message_type: impl Into<String>, kind: MessageKind) -> Self {
        self.message_type = Some(message_type.into());
        self.kind = Some(kind);
        self
    }

    /// Sets type, kind and payload from a typed message body.
    pub fn body<M: Message>(mut self, message: &M) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(message)?);
        self.message_type = Some(M::MESSAGE_TYPE.to_string());
        self.kind = Some(M::KIND);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a header entry.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Adds every entry of a header map.
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Builds the envelope.
    ///
    /// # Panics
    ///
    /// Panics if the message type or payload is not set.
    pub fn build(self) -> MessageEnvelope {
        self.try_build()
            .expect("message_type and payload are required")
    }

    /// Tries to build the envelope, returning None if required fields are missing.
    pub fn try_build(self) -> Option<MessageEnvelope> {
        let message_id = self.message_id.unwrap_or_default();
        Some(MessageEnvelope {
            message_id,
            parent_message_id: self.parent_message_id,
            correlation_id: self
                .correlation_id
                .unwrap_or_else(|| CorrelationId::from(message_id)),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            application_id: self.application_id.unwrap_or_default(),
            saga_id: self.saga_id,
            message_type: self.message_type?,
            kind: self.kind?,
            payload: self.payload?,
            headers: self.headers,
        })
    }
}
