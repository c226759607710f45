//! Message header map and well-known keys.

use std::collections::BTreeMap;

/// Header map carried alongside each message on the bus.
pub type Headers = BTreeMap<String, String>;

/// Header carrying the saga identity.
pub const SAGA_ID_HEADER: &str = "SagaId";

/// W3C trace context header.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// W3C vendor trace state header.
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Content type of the serialized payload.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Wire name of the payload's message type.
pub const MESSAGE_TYPE_HEADER: &str = "message-type";

/// Content type used for JSON payloads.
pub const JSON_CONTENT_TYPE: &str = "application/json";
