use async_trait::async_trait;
use common::{MessageId, SagaId};
use serde::{Serialize, de::DeserializeOwned};

use crate::{Result, SagaData, SagaStepMetadata, StepKey, StepStatus};

/// Outcome of a step status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    /// The write passed transition validation and was stored.
    Recorded,
    /// The write was an exact replay of the stored record; nothing changed.
    Replayed,
}

/// Persistence contract for step metadata and saga data.
///
/// Implementations must be thread-safe (Send + Sync). `log_step` must be
/// atomic per [`StepKey`]: read the last status, validate the transition,
/// write, all under one transaction or compare-and-set, so that concurrent
/// or duplicate delivery never yields two logical executions.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Records a step status.
    ///
    /// An exact replay of the stored record (see
    /// [`SagaStepMetadata::is_idempotent_with`]) is a no-op returning
    /// [`LogOutcome::Replayed`]. Any other write must be a legal transition
    /// from the stored status, otherwise it fails with
    /// `StoreError::IllegalStepTransition` and nothing is written.
    async fn log_step(&self, record: SagaStepMetadata) -> Result<LogOutcome>;

    /// Hands a `Started` step over to a new owner.
    ///
    /// Atomically replaces the current record with `record` (a `Started`
    /// record) only if the step is still `Started` and still owned by
    /// `stale_claim`. Returns false, writing nothing, when the step moved
    /// on or another dispatch reclaimed it first.
    async fn reclaim_step(
        &self,
        record: SagaStepMetadata,
        stale_claim: Option<&str>,
    ) -> Result<bool>;

    /// Returns the last record for a step, if any.
    async fn get_step(&self, key: &StepKey) -> Result<Option<SagaStepMetadata>>;

    /// Returns every step recorded for a saga, ordered by `recorded_at`.
    async fn get_saga_steps(&self, saga_id: SagaId) -> Result<Vec<SagaStepMetadata>>;

    /// Loads the erased saga data.
    async fn load_saga_data_raw(&self, saga_id: SagaId) -> Result<Option<SagaData>>;

    /// Saves the erased saga data, replacing any previous value.
    async fn save_saga_data_raw(&self, saga_id: SagaId, data: SagaData) -> Result<()>;

    /// Returns the last recorded status for a step, `StepStatus::None` if unknown.
    async fn get_step_status(&self, key: &StepKey) -> Result<StepStatus> {
        Ok(self
            .get_step(key)
            .await?
            .map(|record| record.status)
            .unwrap_or_default())
    }

    /// Returns true if the step has already run to an outcome.
    async fn is_step_completed(&self, key: &StepKey) -> Result<bool> {
        Ok(self.get_step_status(key).await?.is_finished())
    }
}

/// Extension trait providing typed and convenience methods for saga stores.
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// Loads saga data and decodes the domain fields into `T`.
    async fn load_saga_data<T>(&self, saga_id: SagaId) -> Result<Option<SagaData<T>>>
    where
        T: DeserializeOwned + Send,
    {
        match self.load_saga_data_raw(saga_id).await? {
            Some(raw) => Ok(Some(raw.decode()?)),
            None => Ok(None),
        }
    }

    /// Serializes and saves saga data.
    async fn save_saga_data<T>(&self, data: &SagaData<T>) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let raw = data.to_raw()?;
        self.save_saga_data_raw(data.saga_id, raw).await
    }

    /// Returns true if the handler finished the step for any message in the saga.
    async fn is_handler_step_completed(
        &self,
        saga_id: SagaId,
        step_type: &str,
        handler_type: &str,
    ) -> Result<bool> {
        Ok(self.get_saga_steps(saga_id).await?.iter().any(|record| {
            record.step_type == step_type
                && record.handler_type == handler_type
                && record.status.is_finished()
        }))
    }

    /// Returns the records whose driving message is `message_id`.
    async fn steps_for_message(
        &self,
        saga_id: SagaId,
        message_id: MessageId,
    ) -> Result<Vec<SagaStepMetadata>> {
        Ok(self
            .get_saga_steps(saga_id)
            .await?
            .into_iter()
            .filter(|record| record.message_id == message_id)
            .collect())
    }
}

// Blanket implementation for all SagaStore implementations
impl<T: SagaStore + ?Sized> SagaStoreExt for T {}
