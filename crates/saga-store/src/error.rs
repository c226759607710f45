use thiserror::Error;

use crate::{StepKey, StepStatus};

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested status change is not allowed by the step state machine.
    #[error("Illegal step transition for {key}: {from} -> {to}")]
    IllegalStepTransition {
        key: StepKey,
        from: StepStatus,
        to: StepStatus,
    },

    /// The backing storage could not be reached. Safe to retry.
    #[error("Saga store unavailable: {0}")]
    Unavailable(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for infrastructure failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
