//! Compensation coordinator: undoes completed steps after a failure.

use std::sync::Arc;

use chrono::Utc;
use common::{CorrelationId, MessageEnvelope, MessageId, MessageKind, SagaId};
use saga_store::{FailureInfo, SagaStepMetadata, SagaStore, StepKey, StepStatus};

use crate::cancellation::CancellationSignal;
use crate::causal::CausalGraph;
use crate::error::{Result, SagaError};
use crate::handler::HandlerRole;
use crate::middleware::Invocation;
use crate::runtime::SagaRuntime;

/// What a compensation run did, per step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    /// Steps now in `Compensated`.
    pub compensated: Vec<StepKey>,
    /// Steps whose compensation failed (`CompensationFailed`, or the write did not land).
    pub failed: Vec<StepKey>,
    /// Completed steps with no compensation handler, or interrupted by cancellation.
    pub skipped: Vec<StepKey>,
}

impl CompensationReport {
    /// Returns true if no compensation failed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.compensated.len() + self.failed.len() + self.skipped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs compensation handlers for the completed steps of a saga.
///
/// Steps are compensated from a snapshot taken when the run starts, in
/// reverse order of their last status write. Only `Completed` steps are
/// selected. A failing compensation is recorded as `CompensationFailed`
/// and the run continues with the remaining steps.
#[derive(Debug, Clone)]
pub struct CompensationCoordinator {
    runtime: Arc<SagaRuntime>,
}

impl CompensationCoordinator {
    pub fn new(runtime: Arc<SagaRuntime>) -> Self {
        Self { runtime }
    }

    /// Compensates every completed step of the saga except `failed_step`.
    #[tracing::instrument(skip(self, failed_step, cancellation), fields(failed_step = %failed_step))]
    pub async fn compensate(
        &self,
        saga_id: SagaId,
        failed_step: &StepKey,
        correlation_id: CorrelationId,
        cancellation: CancellationSignal,
    ) -> Result<CompensationReport> {
        metrics::counter!("saga_compensations_total").increment(1);

        let mut snapshot = self.runtime.store().get_saga_steps(saga_id).await?;
        newest_first(&mut snapshot);
        tracing::info!(%saga_id, steps = snapshot.len(), "Starting compensation");

        let mut report = CompensationReport::default();
        for record in snapshot
            .iter()
            .filter(|r| r.status == StepStatus::Completed && r.key() != *failed_step)
        {
            self.compensate_step(record, correlation_id, &cancellation, &mut report)
                .await;
        }

        tracing::info!(
            %saga_id,
            compensated = report.compensated.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Compensation finished"
        );
        Ok(report)
    }

    /// Compensates the completed steps driven by `message_id`.
    ///
    /// Used when a handler compensates its own step and the undo has to
    /// travel up to the message that caused it.
    #[tracing::instrument(skip(self, cancellation))]
    pub async fn bubble_up(
        &self,
        saga_id: SagaId,
        message_id: MessageId,
        correlation_id: CorrelationId,
        cancellation: CancellationSignal,
    ) -> Result<CompensationReport> {
        let graph = CausalGraph::new(self.runtime.store().get_saga_steps(saga_id).await?);
        let mut targets: Vec<SagaStepMetadata> = graph
            .steps_for(message_id)
            .filter(|r| r.status == StepStatus::Completed)
            .cloned()
            .collect();
        newest_first(&mut targets);

        let mut report = CompensationReport::default();
        for record in &targets {
            self.compensate_step(record, correlation_id, &cancellation, &mut report)
                .await;
        }
        Ok(report)
    }

    async fn compensate_step(
        &self,
        record: &SagaStepMetadata,
        correlation_id: CorrelationId,
        cancellation: &CancellationSignal,
        report: &mut CompensationReport,
    ) {
        let key = record.key();
        let bindings = self
            .runtime
            .registry()
            .compensations_for(&record.message_type_name);
        if bindings.is_empty() {
            tracing::debug!(%key, "No compensation handler registered, skipping step");
            report.skipped.push(key);
            return;
        }

        // The snapshot may be stale when a handler bubbled compensation up.
        match self.runtime.store().get_step_status(&key).await {
            Ok(StepStatus::Completed) => {}
            Ok(current) => {
                tracing::debug!(%key, %current, "Step moved on since the snapshot, skipping");
                return;
            }
            Err(e) => {
                tracing::error!(%key, error = %e, "Failed to read step status");
                report.failed.push(key);
                return;
            }
        }

        let envelope = rebuild_envelope(record, bindings[0].message_kind, correlation_id);
        let mut failure: Option<SagaError> = None;
        for binding in bindings {
            let ctx = self.runtime.load_context(
                record.saga_id,
                record.handler_type.as_str(),
                envelope.clone(),
                cancellation.clone(),
            );
            let invocation = Invocation::new(&ctx, HandlerRole::Compensation);
            if let Err(e) = self.runtime.pipeline().run(&invocation, binding).await {
                tracing::error!(
                    %key,
                    compensation_handler = binding.handler_type,
                    error = %e,
                    "Compensation handler failed"
                );
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(SagaError::Cancelled) => {
                tracing::warn!(%key, "Compensation interrupted by cancellation");
                report.skipped.push(key);
            }
            Some(error) => {
                metrics::counter!(
                    "saga_compensation_failures_total",
                    "message_type" => record.message_type_name.clone()
                )
                .increment(1);
                let failure = FailureInfo::from_error(error.kind_name(), &error);
                self.record_outcome(record, StepStatus::CompensationFailed, Some(failure))
                    .await;
                report.failed.push(key);
            }
            None => match self.record_outcome(record, StepStatus::Compensated, None).await {
                Some(StepStatus::Compensated) => report.compensated.push(key),
                _ => report.failed.push(key),
            },
        }
    }

    /// Writes the outcome unless the handler already moved the step on.
    /// Returns the step's final status, `None` if it could not be read.
    async fn record_outcome(
        &self,
        record: &SagaStepMetadata,
        status: StepStatus,
        failure: Option<FailureInfo>,
    ) -> Option<StepStatus> {
        let store = self.runtime.store();
        let key = record.key();
        match store.get_step_status(&key).await {
            Ok(StepStatus::Completed) => {}
            Ok(current) => {
                tracing::debug!(%key, %current, "Compensation outcome already recorded");
                return Some(current);
            }
            Err(e) => {
                tracing::error!(%key, error = %e, "Failed to read step status");
                return None;
            }
        }

        let mut next = record.clone();
        next.status = status;
        next.failure_info = failure;
        next.recorded_at = Utc::now();
        match store.log_step(next).await {
            Ok(_) => Some(status),
            Err(e) => {
                tracing::error!(%key, %status, error = %e, "Failed to record compensation outcome");
                store.get_step_status(&key).await.ok()
            }
        }
    }
}

fn newest_first(steps: &mut [SagaStepMetadata]) {
    steps.sort_by(|a, b| {
        b.recorded_at
            .cmp(&a.recorded_at)
            .then(b.sequence.cmp(&a.sequence))
    });
}

/// Reconstructs the message that drove a step from its record.
fn rebuild_envelope(
    record: &SagaStepMetadata,
    kind: MessageKind,
    correlation_id: CorrelationId,
) -> MessageEnvelope {
    MessageEnvelope {
        message_id: record.message_id,
        parent_message_id: record.parent_message_id,
        correlation_id,
        timestamp: record.recorded_at,
        application_id: record.application_id.clone(),
        saga_id: Some(record.saga_id),
        message_type: record.message_type_name.clone(),
        kind,
        payload: record
            .message_payload
            .clone()
            .unwrap_or(serde_json::Value::Null),
        headers: Default::default(),
    }
}
