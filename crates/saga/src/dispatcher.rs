//! Routes inbound messages to their handlers with idempotency and failure handling.

use std::sync::Arc;

use chrono::Utc;
use common::headers::SAGA_ID_HEADER;
use common::{MessageEnvelope, MessageId, SagaId};
use futures_util::future::join_all;
use saga_store::{FailureInfo, LogOutcome, SagaStepMetadata, SagaStore, StepKey, StepStatus};
use uuid::Uuid;

use crate::cancellation::CancellationSignal;
use crate::causal::CausalGraph;
use crate::context::SagaContext;
use crate::coordinator::{CompensationCoordinator, CompensationReport};
use crate::error::{Result, SagaError};
use crate::handler::HandlerRole;
use crate::middleware::Invocation;
use crate::registry::HandlerBinding;
use crate::retry::NoopObserver;
use crate::runtime::SagaRuntime;

/// What happened to one handler during a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The handler ran and succeeded.
    Handled,
    /// The step already finished for this handler and message, or another
    /// dispatch owns it; the handler was not called.
    Skipped,
    /// The handler failed; the step was marked `Failed`.
    Failed {
        error_type: &'static str,
        reason: String,
    },
    /// The handler observed cancellation; the step was released unfinished.
    Cancelled,
}

/// Who owns a step when a dispatch reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Acquired,
    Finished,
    HeldElsewhere,
}

/// Outcome of one handler binding.
#[derive(Debug, Clone)]
pub struct HandlerReport {
    pub handler_type: &'static str,
    pub role: HandlerRole,
    pub outcome: HandlerOutcome,
    /// Set when the failure triggered compensation.
    pub compensation: Option<CompensationReport>,
}

/// Outcome of dispatching one message to all its handlers.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub saga_id: SagaId,
    pub message_id: MessageId,
    pub message_type: String,
    pub handlers: Vec<HandlerReport>,
}

impl DispatchReport {
    /// Outcome of the named handler, if it was part of the dispatch.
    pub fn outcome_of(&self, handler_type: &str) -> Option<&HandlerOutcome> {
        self.handlers
            .iter()
            .find(|h| h.handler_type == handler_type)
            .map(|h| &h.outcome)
    }

    /// Number of handlers whose outcome matches.
    pub fn count(&self, outcome: fn(&HandlerOutcome) -> bool) -> usize {
        self.handlers.iter().filter(|h| outcome(&h.outcome)).count()
    }
}

/// Invokes every handler registered for an inbound message.
///
/// For each handler the step `(saga, message type, handler, message id)`
/// is claimed first: a `Started` record stamped with a fresh claim id is
/// written, and only the dispatch whose write lands runs the handler.
/// Finished steps and steps owned by another live dispatch are skipped.
/// A `Started` step whose claim was released by cancellation, or is older
/// than [`SagaConfig::claim_timeout`](crate::SagaConfig), is reclaimed.
///
/// The handler then runs through the middleware pipeline. A failing
/// handler gets its step marked `Failed`, the saga data flagged, and
/// compensation triggered when configured.
///
/// Dispatches of different messages are independent and may run
/// concurrently; fan-out handlers of one message run concurrently too.
#[derive(Debug, Clone)]
pub struct SagaDispatcher {
    runtime: Arc<SagaRuntime>,
}

impl SagaDispatcher {
    /// Creates a dispatcher over a runtime.
    pub fn new(runtime: Arc<SagaRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<SagaRuntime> {
        &self.runtime
    }

    /// Dispatches to every handler of the message type.
    pub async fn dispatch(&self, envelope: MessageEnvelope) -> Result<DispatchReport> {
        self.dispatch_with(envelope, None, CancellationSignal::never())
            .await
    }

    /// Dispatches to the handlers of the message type, optionally restricted
    /// to one handler, observing `cancellation`.
    ///
    /// Returns an error when the message cannot be routed (no handler, no
    /// saga id, undecodable payload) or when infrastructure failed before
    /// an outcome could be recorded. Handler failures are reported in the
    /// [`DispatchReport`], not as errors.
    #[tracing::instrument(
        skip_all,
        fields(
            message_type = %envelope.message_type,
            message_id = %envelope.message_id,
            correlation_id = %envelope.correlation_id
        )
    )]
    pub async fn dispatch_with(
        &self,
        envelope: MessageEnvelope,
        handler_filter: Option<&str>,
        cancellation: CancellationSignal,
    ) -> Result<DispatchReport> {
        metrics::counter!("saga_dispatch_total", "message_type" => envelope.message_type.clone())
            .increment(1);

        let bindings: Vec<&HandlerBinding> = self
            .runtime
            .registry()
            .handlers_for(&envelope.message_type)
            .iter()
            .filter(|b| handler_filter.is_none_or(|h| h == b.handler_type))
            .collect();
        if bindings.is_empty() {
            return Err(SagaError::HandlerResolution(format!(
                "no handler registered for message type '{}'",
                envelope.message_type
            )));
        }

        let existing = saga_id_of(&envelope)?;
        let saga_id = match existing {
            Some(id) => id,
            None if bindings.iter().any(|b| b.role == HandlerRole::Start) => {
                let id = self.runtime.ids().next_saga_id();
                tracing::info!(saga_id = %id, "Starting new saga");
                id
            }
            None => {
                return Err(SagaError::HandlerResolution(format!(
                    "message '{}' carries no saga id and has no start handler",
                    envelope.message_type
                )));
            }
        };

        let bindings = self.match_responses(saga_id, &envelope, bindings).await?;

        let runs = bindings.into_iter().map(|binding| {
            let envelope = &envelope;
            let cancellation = cancellation.clone();
            async move {
                if existing.is_none() && binding.role != HandlerRole::Start {
                    tracing::warn!(
                        handler = binding.handler_type,
                        "Non-start handler skipped: message carries no saga id"
                    );
                    return Ok(HandlerReport {
                        handler_type: binding.handler_type,
                        role: binding.role,
                        outcome: HandlerOutcome::Failed {
                            error_type: "HandlerResolutionFailure",
                            reason: "message carries no saga id".to_string(),
                        },
                        compensation: None,
                    });
                }
                self.run_binding(saga_id, binding, envelope, cancellation)
                    .await
            }
        });

        let mut handlers = Vec::new();
        let mut first_error = None;
        for result in join_all(runs).await {
            match result {
                Ok(report) => handlers.push(report),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        Ok(DispatchReport {
            saga_id,
            message_id: envelope.message_id,
            message_type: envelope.message_type,
            handlers,
        })
    }

    /// Keeps only the response handlers whose request type matches the
    /// request this response answers.
    async fn match_responses<'b>(
        &self,
        saga_id: SagaId,
        envelope: &MessageEnvelope,
        bindings: Vec<&'b HandlerBinding>,
    ) -> Result<Vec<&'b HandlerBinding>> {
        if bindings.iter().all(|b| b.request_type.is_none()) {
            return Ok(bindings);
        }
        let Some(parent) = envelope.parent_message_id else {
            return Err(SagaError::HandlerResolution(format!(
                "response '{}' has no parent message id",
                envelope.message_type
            )));
        };

        let graph = CausalGraph::new(self.runtime.store().get_saga_steps(saga_id).await?);
        let Some(request_type) = graph.message_type_of(parent) else {
            tracing::debug!(%parent, "Request not tracked locally, keeping all response handlers");
            return Ok(bindings);
        };

        let matched: Vec<_> = bindings
            .into_iter()
            .filter(|b| b.request_type.is_none_or(|t| t == request_type))
            .collect();
        if matched.is_empty() {
            return Err(SagaError::HandlerResolution(format!(
                "response '{}' answers '{}', which has no registered response handler",
                envelope.message_type, request_type
            )));
        }
        Ok(matched)
    }

    async fn run_binding(
        &self,
        saga_id: SagaId,
        binding: &HandlerBinding,
        envelope: &MessageEnvelope,
        cancellation: CancellationSignal,
    ) -> Result<HandlerReport> {
        let ctx = self
            .runtime
            .load_context(
                saga_id,
                binding.handler_type,
                envelope.clone(),
                cancellation,
            )
            .with_claim(Uuid::new_v4().to_string());
        let step_type = envelope.message_type.as_str();
        let key = ctx.step_key_for(step_type);
        let report = |outcome, compensation| HandlerReport {
            handler_type: binding.handler_type,
            role: binding.role,
            outcome,
            compensation,
        };

        match self.claim(&ctx, step_type, &key).await? {
            Claim::Acquired => {}
            Claim::Finished => {
                tracing::info!(%key, "Step already processed, skipping handler");
                return Ok(report(HandlerOutcome::Skipped, None));
            }
            Claim::HeldElsewhere => {
                tracing::info!(%key, "Step owned by another dispatch, skipping handler");
                metrics::counter!(
                    "saga_duplicate_dispatch_total",
                    "handler" => binding.handler_type
                )
                .increment(1);
                return Ok(report(HandlerOutcome::Skipped, None));
            }
        }

        let invocation = Invocation::new(&ctx, binding.role);
        match self.runtime.pipeline().run(&invocation, binding).await {
            Ok(()) => {
                self.complete_if_unmarked(&ctx, step_type, &key).await?;
                Ok(report(HandlerOutcome::Handled, None))
            }
            Err(SagaError::Cancelled) => {
                self.release(&ctx, step_type, &key).await?;
                Ok(report(HandlerOutcome::Cancelled, None))
            }
            Err(error) => {
                let compensation = self.fail_step(&ctx, step_type, &key, &error).await?;
                if error.is_dead_letter() {
                    return Err(error);
                }
                Ok(report(
                    HandlerOutcome::Failed {
                        error_type: error.kind_name(),
                        reason: error.to_string(),
                    },
                    compensation,
                ))
            }
        }
    }

    /// Makes this dispatch the owner of the step.
    ///
    /// The claim is the `Started` write itself: the store accepts one
    /// `Started` record per step and rejects a second one carrying another
    /// claim id, so of two concurrent dispatches exactly one acquires it.
    async fn claim(&self, ctx: &SagaContext, step_type: &str, key: &StepKey) -> Result<Claim> {
        let store = self.runtime.store();
        let retry = &self.runtime.config().retry;

        let current = retry
            .execute(
                move |_| async move { Ok(store.get_step(key).await?) },
                &NoopObserver,
            )
            .await?;

        let acquired = match current {
            Some(current) if current.status.is_finished() => return Ok(Claim::Finished),
            None => {
                let written = retry
                    .execute(
                        move |_| {
                            let record = ctx.claim_record(step_type);
                            async move { Ok(store.log_step(record).await?) }
                        },
                        &NoopObserver,
                    )
                    .await;
                match written {
                    // Only a retry of this claim's own write can replay it.
                    Ok(LogOutcome::Recorded | LogOutcome::Replayed) => true,
                    Err(SagaError::IllegalStepTransition { .. }) => false,
                    Err(e) => return Err(e),
                }
            }
            Some(current) if self.is_reclaimable(&current) => {
                let stale = current.claim_id.as_deref();
                tracing::warn!(
                    %key,
                    stale_claim = stale.unwrap_or("released"),
                    "Reclaiming step left started by an earlier dispatch"
                );
                retry
                    .execute(
                        move |_| {
                            let record = ctx.claim_record(step_type);
                            async move { Ok(store.reclaim_step(record, stale).await?) }
                        },
                        &NoopObserver,
                    )
                    .await?
            }
            Some(_) => false,
        };

        Ok(if acquired {
            Claim::Acquired
        } else {
            Claim::HeldElsewhere
        })
    }

    /// A `Started` step may be taken over once its owner released it or
    /// its claim outlived the configured timeout.
    fn is_reclaimable(&self, record: &SagaStepMetadata) -> bool {
        record.claim_id.is_none()
            || (Utc::now() - record.recorded_at)
                .to_std()
                .is_ok_and(|age| age >= self.runtime.config().claim_timeout)
    }

    /// Gives up the claim of a cancelled handler so redelivery can run it.
    async fn release(&self, ctx: &SagaContext, step_type: &str, key: &StepKey) -> Result<()> {
        let released = self
            .runtime
            .store()
            .reclaim_step(ctx.release_record(step_type), ctx.claim_id())
            .await?;
        if released {
            tracing::info!(%key, "Handler cancelled, step released for redelivery");
        } else {
            tracing::info!(%key, "Handler cancelled after the step moved on");
        }
        Ok(())
    }

    /// A handler that succeeded without recording an outcome has its step completed.
    async fn complete_if_unmarked(
        &self,
        ctx: &SagaContext,
        step_type: &str,
        key: &StepKey,
    ) -> Result<()> {
        if ctx.cancellation().is_cancelled()
            || self.runtime.store().get_step_status(key).await? != StepStatus::Started
        {
            return Ok(());
        }
        match ctx.mark_step(step_type, StepStatus::Completed, None).await {
            Ok(_) | Err(SagaError::IllegalStepTransition { .. }) | Err(SagaError::Cancelled) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Records the failure and runs compensation when configured.
    async fn fail_step(
        &self,
        ctx: &SagaContext,
        step_type: &str,
        key: &StepKey,
        error: &SagaError,
    ) -> Result<Option<CompensationReport>> {
        metrics::counter!(
            "saga_handler_failures_total",
            "handler" => ctx.handler_type().to_string(),
            "error_type" => error.kind_name()
        )
        .increment(1);

        let failure = FailureInfo::from_error(error.kind_name(), error);
        match ctx.mark_step(step_type, StepStatus::Failed, Some(failure)).await {
            Ok(_) => {}
            Err(SagaError::IllegalStepTransition { from, .. }) => {
                tracing::warn!(%key, %from, "Step already moved on, failure not recorded");
            }
            Err(e) => return Err(e),
        }
        ctx.fail_saga(step_type).await?;

        if !self.runtime.config().compensate_on_failure || error.is_dead_letter() {
            return Ok(None);
        }
        let report = CompensationCoordinator::new(Arc::clone(&self.runtime))
            .compensate(
                ctx.saga_id(),
                key,
                ctx.correlation_id(),
                ctx.cancellation().clone(),
            )
            .await?;
        Ok(Some(report))
    }
}

fn saga_id_of(envelope: &MessageEnvelope) -> Result<Option<SagaId>> {
    if let Some(id) = envelope.saga_id {
        return Ok(Some(id));
    }
    match envelope.header(SAGA_ID_HEADER) {
        Some(raw) => SagaId::parse(raw).map(Some).map_err(|e| {
            SagaError::HandlerResolution(format!("invalid {SAGA_ID_HEADER} header '{raw}': {e}"))
        }),
        None => Ok(None),
    }
}
