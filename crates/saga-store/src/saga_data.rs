//! Per-saga aggregate state.

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Saga-wide state owned by the orchestrating handler chain.
///
/// The audit fields are maintained by the engine; `data` holds the
/// domain-specific fields of each saga implementation. Stores persist the
/// erased form `SagaData<serde_json::Value>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaData<T = serde_json::Value> {
    pub saga_id: SagaId,
    pub is_completed: bool,
    pub failed_step_type: Option<String>,
    pub failed_handler_type: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub data: T,
}

impl<T> SagaData<T> {
    /// Creates fresh saga data for a saga that just started.
    pub fn new(saga_id: SagaId, data: T) -> Self {
        Self {
            saga_id,
            is_completed: false,
            failed_step_type: None,
            failed_handler_type: None,
            completed_at: None,
            failed_at: None,
            data,
        }
    }

    /// Marks the saga as successfully completed.
    pub fn mark_completed(&mut self) {
        self.is_completed = true;
        self.completed_at = Some(Utc::now());
    }

    /// Records the step that failed the saga.
    pub fn mark_failed(&mut self, step_type: impl Into<String>, handler_type: impl Into<String>) {
        self.failed_step_type = Some(step_type.into());
        self.failed_handler_type = Some(handler_type.into());
        self.failed_at = Some(Utc::now());
    }

    /// Returns true if a step failure has been recorded.
    pub fn has_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Replaces the domain data, keeping the audit fields.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SagaData<U> {
        SagaData {
            saga_id: self.saga_id,
            is_completed: self.is_completed,
            failed_step_type: self.failed_step_type,
            failed_handler_type: self.failed_handler_type,
            completed_at: self.completed_at,
            failed_at: self.failed_at,
            data: f(self.data),
        }
    }
}

impl<T: Serialize> SagaData<T> {
    /// Converts to the erased form persisted by stores.
    pub fn to_raw(&self) -> Result<SagaData, serde_json::Error> {
        Ok(SagaData {
            saga_id: self.saga_id,
            is_completed: self.is_completed,
            failed_step_type: self.failed_step_type.clone(),
            failed_handler_type: self.failed_handler_type.clone(),
            completed_at: self.completed_at,
            failed_at: self.failed_at,
            data: serde_json::to_value(&self.data)?,
        })
    }
}

impl SagaData {
    /// Decodes the domain data into `T`.
    pub fn decode<T: DeserializeOwned>(self) -> Result<SagaData<T>, serde_json::Error> {
        let data = serde_json::from_value(self.data.clone())?;
        Ok(self.map(|_| data))
    }
}
