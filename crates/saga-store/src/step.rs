//! Step records and their identity.

use chrono::{DateTime, Utc};
use common::{MessageId, SagaId};
use serde::{Deserialize, Serialize};

use crate::status::StepStatus;

/// Identity of one tracked step.
///
/// Keying by handler and message id as well as step type lets several
/// handlers react to the same event without one handler's completion
/// masking another's.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    pub saga_id: SagaId,
    pub step_type: String,
    pub handler_type: String,
    pub message_id: MessageId,
}

impl StepKey {
    /// Creates a new step key.
    pub fn new(
        saga_id: SagaId,
        step_type: impl Into<String>,
        handler_type: impl Into<String>,
        message_id: MessageId,
    ) -> Self {
        Self {
            saga_id,
            step_type: step_type.into(),
            handler_type: handler_type.into(),
            message_id,
        }
    }
}

impl std::fmt::Display for StepKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.saga_id, self.step_type, self.handler_type, self.message_id
        )
    }
}

/// Details about why a step or its compensation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Human readable reason.
    pub reason: String,
    /// Name of the error kind that caused the failure.
    pub error_type: Option<String>,
    /// Extended error detail.
    pub detail: Option<String>,
    /// When the failure happened.
    pub failed_at: DateTime<Utc>,
}

impl FailureInfo {
    /// Creates failure info with just a reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            error_type: None,
            detail: None,
            failed_at: Utc::now(),
        }
    }

    /// Builds failure info from an error value.
    pub fn from_error<E: std::error::Error + ?Sized>(error_type: &str, error: &E) -> Self {
        Self {
            reason: error.to_string(),
            error_type: Some(error_type.to_string()),
            detail: Some(format!("{error:?}")),
            failed_at: Utc::now(),
        }
    }

    /// Sets the error type.
    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Sets the detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Persisted record of one step status write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStepMetadata {
    pub saga_id: SagaId,
    pub step_type: String,
    pub handler_type: String,
    pub status: StepStatus,
    pub message_id: MessageId,
    pub parent_message_id: Option<MessageId>,
    pub message_type_name: String,
    pub application_id: String,
    /// Serialized body of the message that drove the step.
    pub message_payload: Option<serde_json::Value>,
    pub failure_info: Option<FailureInfo>,
    /// Dispatch that owns a `Started` step. `None` once released.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
    /// Store-assigned write sequence, breaks `recorded_at` ties.
    #[serde(default)]
    pub sequence: u64,
}

impl SagaStepMetadata {
    /// Creates a record builder for the given step.
    pub fn builder(key: StepKey, status: StepStatus) -> StepRecordBuilder {
        StepRecordBuilder::new(key, status)
    }

    /// Builds a record from raw inputs, serializing the payload.
    pub fn build<P: Serialize + ?Sized>(
        key: StepKey,
        status: StepStatus,
        message_type_name: impl Into<String>,
        application_id: impl Into<String>,
        parent_message_id: Option<MessageId>,
        payload: Option<&P>,
    ) -> Result<Self, serde_json::Error> {
        let payload = payload.map(serde_json::to_value).transpose()?;
        let mut builder = Self::builder(key, status)
            .message_type_name(message_type_name)
            .application_id(application_id);
        if let Some(parent) = parent_message_id {
            builder = builder.parent_message_id(parent);
        }
        if let Some(payload) = payload {
            builder = builder.payload_raw(payload);
        }
        Ok(builder.build())
    }

    /// Returns the step identity of this record.
    pub fn key(&self) -> StepKey {
        StepKey {
            saga_id: self.saga_id,
            step_type: self.step_type.clone(),
            handler_type: self.handler_type.clone(),
            message_id: self.message_id,
        }
    }

    /// Returns true if `other` is an exact replay of this record.
    ///
    /// Only `recorded_at` (and the store sequence that orders it) is ignored,
    /// so two dispatches claiming the same step never replay each other.
    pub fn is_idempotent_with(&self, other: &SagaStepMetadata) -> bool {
        self.message_id == other.message_id
            && self.claim_id == other.claim_id
            && self.parent_message_id == other.parent_message_id
            && self.status == other.status
            && self.message_type_name == other.message_type_name
            && self.application_id == other.application_id
            && self.message_payload == other.message_payload
            && self.failure_info == other.failure_info
    }
}

/// Builder for step records.
#[derive(Debug)]
pub struct StepRecordBuilder {
    key: StepKey,
    status: StepStatus,
    parent_message_id: Option<MessageId>,
    message_type_name: Option<String>,
    application_id: String,
    payload: Option<serde_json::Value>,
    failure_info: Option<FailureInfo>,
    claim_id: Option<String>,
    recorded_at: Option<DateTime<Utc>>,
}

impl StepRecordBuilder {
    fn new(key: StepKey, status: StepStatus) -> Self {
        Self {
            key,
            status,
            parent_message_id: None,
            message_type_name: None,
            application_id: String::new(),
            payload: None,
            failure_info: None,
            claim_id: None,
            recorded_at: None,
        }
    }

    /// Sets the causing message.
    pub fn parent_message_id(mut self, id: MessageId) -> Self {
        self.parent_message_id = Some(id);
        self
    }

    /// Sets the type name of the message that drove the step.
    /// Defaults to the step type.
    pub fn message_type_name(mut self, name: impl Into<String>) -> Self {
        self.message_type_name = Some(name.into());
        self
    }

    /// Sets the application that recorded the step.
    pub fn application_id(mut self, application_id: impl Into<String>) -> Self {
        self.application_id = application_id.into();
        self
    }

    /// Sets the already-serialized payload.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attaches failure information.
    pub fn failure(mut self, failure: FailureInfo) -> Self {
        self.failure_info = Some(failure);
        self
    }

    /// Stamps the dispatch that owns the step.
    pub fn claim_id(mut self, claim_id: impl Into<String>) -> Self {
        self.claim_id = Some(claim_id.into());
        self
    }

    /// Sets the record time. If not set, the current time will be used.
    pub fn recorded_at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = Some(recorded_at);
        self
    }

    /// Builds the record.
    pub fn build(self) -> SagaStepMetadata {
        let message_type_name = self
            .message_type_name
            .unwrap_or_else(|| self.key.step_type.clone());
        SagaStepMetadata {
            saga_id: self.key.saga_id,
            step_type: self.key.step_type,
            handler_type: self.key.handler_type,
            status: self.status,
            message_id: self.key.message_id,
            parent_message_id: self.parent_message_id,
            message_type_name,
            application_id: self.application_id,
            message_payload: self.payload,
            failure_info: self.failure_info,
            claim_id: self.claim_id,
            recorded_at: self.recorded_at.unwrap_or_else(Utc::now),
            sequence: 0,
        }
    }
}
