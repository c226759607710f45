//! Saga error types.

use saga_store::{StepKey, StepStatus, StoreError};
use thiserror::Error;

use crate::bus::BusError;

/// Errors that can occur while coordinating a saga.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A status write was rejected by the step state machine.
    #[error("Illegal step transition for {key}: {from} -> {to}")]
    IllegalStepTransition {
        key: StepKey,
        from: StepStatus,
        to: StepStatus,
    },

    /// Saga store error other than a rejected transition.
    #[error("Saga store error: {0}")]
    Store(StoreError),

    /// Transport or storage failure that is worth retrying.
    #[error("Transient infrastructure error: {0}")]
    TransientInfrastructure(String),

    /// No handler could be resolved for a message, or routing metadata is missing.
    #[error("Handler resolution failed: {0}")]
    HandlerResolution(String),

    /// A payload or saga data could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A business handler reported failure.
    #[error("Step failed: {0}")]
    Handler(String),

    /// A compensation handler failed.
    #[error("Compensation for '{step}' failed: {reason}")]
    CompensationHandler { step: String, reason: String },

    /// The message bus rejected an operation.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// The operation observed a cancellation request.
    #[error("Operation cancelled")]
    Cancelled,
}

impl SagaError {
    /// A business failure raised by handler code.
    pub fn handler(reason: impl Into<String>) -> Self {
        SagaError::Handler(reason.into())
    }

    /// An infrastructure failure the retry middleware should retry.
    pub fn transient(reason: impl Into<String>) -> Self {
        SagaError::TransientInfrastructure(reason.into())
    }

    /// Returns true for failures that may succeed when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::TransientInfrastructure(_) => true,
            SagaError::Store(e) => e.is_transient(),
            SagaError::Bus(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Returns true for messages that can never be handled and belong in a dead-letter queue.
    pub fn is_dead_letter(&self) -> bool {
        matches!(
            self,
            SagaError::HandlerResolution(_) | SagaError::Serialization(_)
        )
    }

    /// Stable classification name, stored as `FailureInfo::error_type`.
    pub fn kind_name(&self) -> &'static str {
        match self {
            SagaError::IllegalStepTransition { .. } => "IllegalStepTransition",
            SagaError::Store(_) => "StoreFailure",
            SagaError::TransientInfrastructure(_) => "TransientInfrastructureFailure",
            SagaError::HandlerResolution(_) => "HandlerResolutionFailure",
            SagaError::Serialization(_) => "SerializationFailure",
            SagaError::Handler(_) => "HandlerFailure",
            SagaError::CompensationHandler { .. } => "CompensationHandlerFailure",
            SagaError::Bus(_) => "BusFailure",
            SagaError::Cancelled => "Cancelled",
        }
    }
}

impl From<StoreError> for SagaError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::IllegalStepTransition { key, from, to } => {
                SagaError::IllegalStepTransition { key, from, to }
            }
            StoreError::Serialization(e) => SagaError::Serialization(e),
            other => SagaError::Store(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
