use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use tokio::sync::RwLock;

use crate::{
    LogOutcome, Result, SagaData, SagaStepMetadata, StepKey, StepStatus, StoreError,
    status::is_valid_transition, store::SagaStore,
};

#[derive(Debug, Default)]
struct InMemoryState {
    steps: HashMap<StepKey, SagaStepMetadata>,
    saga_data: HashMap<SagaId, SagaData>,
    next_sequence: u64,
    unavailable: bool,
}

/// In-memory saga store for tests and single-process deployments.
///
/// All writes go through one lock, so the read-validate-write in
/// `log_step` is atomic per key.
#[derive(Debug, Clone, Default)]
pub struct InMemorySagaStore {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail with `StoreError::Unavailable` while set.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    /// Returns the total number of step records.
    pub async fn step_count(&self) -> usize {
        self.state.read().await.steps.len()
    }

    /// Clears all steps and saga data.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.steps.clear();
        state.saga_data.clear();
    }
}

fn unavailable() -> StoreError {
    StoreError::Unavailable("in-memory store switched off".to_string())
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn log_step(&self, mut record: SagaStepMetadata) -> Result<LogOutcome> {
        let key = record.key();
        let mut state = self.state.write().await;
        if state.unavailable {
            return Err(unavailable());
        }

        let previous = state.steps.get(&key);
        if let Some(existing) = previous
            && existing.is_idempotent_with(&record)
        {
            tracing::debug!(%key, status = %record.status, "step write is a replay");
            return Ok(LogOutcome::Replayed);
        }

        let from = previous.map(|r| r.status).unwrap_or(StepStatus::None);
        if !is_valid_transition(from, record.status) {
            return Err(StoreError::IllegalStepTransition {
                key,
                from,
                to: record.status,
            });
        }

        state.next_sequence += 1;
        record.sequence = state.next_sequence;
        tracing::debug!(%key, %from, to = %record.status, "step status recorded");
        metrics::counter!("saga_step_writes_total", "status" => record.status.as_str())
            .increment(1);
        state.steps.insert(key, record);

        Ok(LogOutcome::Recorded)
    }

    async fn reclaim_step(
        &self,
        mut record: SagaStepMetadata,
        stale_claim: Option<&str>,
    ) -> Result<bool> {
        let key = record.key();
        if record.status != StepStatus::Started {
            return Err(StoreError::IllegalStepTransition {
                key,
                from: StepStatus::Started,
                to: record.status,
            });
        }
        let mut state = self.state.write().await;
        if state.unavailable {
            return Err(unavailable());
        }

        match state.steps.get(&key) {
            Some(current)
                if current.status == StepStatus::Started
                    && current.claim_id.as_deref() == stale_claim => {}
            _ => return Ok(false),
        }

        state.next_sequence += 1;
        record.sequence = state.next_sequence;
        tracing::debug!(%key, stale_claim, claim = record.claim_id.as_deref(), "step reclaimed");
        metrics::counter!("saga_step_reclaims_total").increment(1);
        state.steps.insert(key, record);

        Ok(true)
    }

    async fn get_step(&self, key: &StepKey) -> Result<Option<SagaStepMetadata>> {
        let state = self.state.read().await;
        if state.unavailable {
            return Err(unavailable());
        }
        Ok(state.steps.get(key).cloned())
    }

    async fn get_saga_steps(&self, saga_id: SagaId) -> Result<Vec<SagaStepMetadata>> {
        let state = self.state.read().await;
        if state.unavailable {
            return Err(unavailable());
        }
        let mut steps: Vec<_> = state
            .steps
            .values()
            .filter(|r| r.saga_id == saga_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(steps)
    }

    async fn load_saga_data_raw(&self, saga_id: SagaId) -> Result<Option<SagaData>> {
        let state = self.state.read().await;
        if state.unavailable {
            return Err(unavailable());
        }
        Ok(state.saga_data.get(&saga_id).cloned())
    }

    async fn save_saga_data_raw(&self, saga_id: SagaId, mut data: SagaData) -> Result<()> {
        let mut state = self.state.write().await;
        if state.unavailable {
            return Err(unavailable());
        }
        data.saga_id = saga_id;
        state.saga_data.insert(saga_id, data);
        Ok(())
    }
}
