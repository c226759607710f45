//! Per-message saga context handed to handlers.

use std::sync::Arc;

use common::headers::{
    CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE, MESSAGE_TYPE_HEADER, SAGA_ID_HEADER,
};
use common::{
    Command, CorrelationId, Event, Headers, Message, MessageEnvelope, MessageId, Response, SagaId,
};
use saga_store::{
    FailureInfo, LogOutcome, SagaData, SagaStepMetadata, SagaStore, SagaStoreExt, StepKey,
    StepStatus,
};
use serde::{Serialize, de::DeserializeOwned};

use crate::cancellation::CancellationSignal;
use crate::coordinator::{CompensationCoordinator, CompensationReport};
use crate::error::{Result, SagaError};
use crate::runtime::SagaRuntime;
use crate::trace_context::{self, TraceContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Send,
    Publish,
}

/// Everything a handler needs to take part in a saga while handling one message.
///
/// A context is scoped to `(saga id, handler type, current message)`.
/// Outgoing messages are stamped with the saga id, are parented to the
/// current message and keep its correlation id. Status writes target the
/// step key `(saga id, step type, handler type, current message id)`.
pub struct SagaContext {
    runtime: Arc<SagaRuntime>,
    saga_id: SagaId,
    handler_type: String,
    message: MessageEnvelope,
    trace: TraceContext,
    cancellation: CancellationSignal,
    claim: Option<String>,
}

impl SagaContext {
    pub(crate) fn new(
        runtime: Arc<SagaRuntime>,
        saga_id: SagaId,
        handler_type: String,
        mut message: MessageEnvelope,
        cancellation: CancellationSignal,
    ) -> Self {
        message.saga_id.get_or_insert(saga_id);
        let trace = trace_context::continue_from(&message.headers);
        Self {
            runtime,
            saga_id,
            handler_type,
            message,
            trace,
            cancellation,
            claim: None,
        }
    }

    /// Stamps `Started` writes of this context with the dispatch's claim.
    pub(crate) fn with_claim(mut self, claim: String) -> Self {
        self.claim = Some(claim);
        self
    }

    /// The saga this handler takes part in.
    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    /// Name the handler was registered under.
    pub fn handler_type(&self) -> &str {
        &self.handler_type
    }

    /// The message being handled.
    pub fn message(&self) -> &MessageEnvelope {
        &self.message
    }

    /// Id of the message being handled.
    pub fn message_id(&self) -> MessageId {
        self.message.message_id
    }

    /// Id of the message that caused the current one.
    pub fn parent_message_id(&self) -> Option<MessageId> {
        self.message.parent_message_id
    }

    /// Correlation id shared by every message of the conversation.
    pub fn correlation_id(&self) -> CorrelationId {
        self.message.correlation_id
    }

    /// Identity of this participant.
    pub fn application_id(&self) -> &str {
        &self.runtime.config().application_id
    }

    /// Trace span of this handler invocation.
    pub fn trace_context(&self) -> &TraceContext {
        &self.trace
    }

    /// Cancellation signal of the current dispatch.
    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancellation
    }

    /// Id of the dispatch that owns this context's step, if dispatched.
    pub fn claim_id(&self) -> Option<&str> {
        self.claim.as_deref()
    }

    pub fn runtime(&self) -> &Arc<SagaRuntime> {
        &self.runtime
    }

    /// Wraps a message caused by the current one.
    pub fn envelope_for<M: Message>(&self, message: &M) -> Result<MessageEnvelope> {
        let mut headers = Headers::new();
        headers.insert(SAGA_ID_HEADER.to_string(), self.saga_id.to_string());
        headers.insert(MESSAGE_TYPE_HEADER.to_string(), M::MESSAGE_TYPE.to_string());
        headers.insert(CONTENT_TYPE_HEADER.to_string(), JSON_CONTENT_TYPE.to_string());
        trace_context::inject(&self.trace, &mut headers);

        Ok(MessageEnvelope::builder()
            .message_id(self.runtime.ids().next_message_id())
            .body(message)?
            .parent_message_id(self.message.message_id)
            .correlation_id(self.message.correlation_id)
            .saga_id(self.saga_id)
            .application_id(self.application_id())
            .headers(headers)
            .build())
    }

    /// Sends a command. Returns the new message's id.
    pub async fn send<C: Command>(&self, command: C) -> Result<MessageId> {
        let envelope = self.envelope_for(&command)?;
        self.deliver(Route::Send, envelope).await
    }

    /// Publishes an event. Returns the new message's id.
    pub async fn publish<E: Event>(&self, event: E) -> Result<MessageId> {
        let envelope = self.envelope_for(&event)?;
        self.deliver(Route::Publish, envelope).await
    }

    /// Replies to the request being handled.
    pub async fn respond<R: Response>(&self, response: R) -> Result<MessageId> {
        let envelope = self.envelope_for(&response)?;
        self.deliver(Route::Send, envelope).await
    }

    /// Starts a send whose step status is written only after the send succeeds.
    pub fn send_with_tracking<C: Command>(&self, command: C) -> TrackedOperation<'_> {
        TrackedOperation {
            context: self,
            route: Route::Send,
            envelope: self.envelope_for(&command),
        }
    }

    /// Starts a publish whose step status is written only after the publish succeeds.
    pub fn publish_with_tracking<E: Event>(&self, event: E) -> TrackedOperation<'_> {
        TrackedOperation {
            context: self,
            route: Route::Publish,
            envelope: self.envelope_for(&event),
        }
    }

    async fn deliver(&self, route: Route, envelope: MessageEnvelope) -> Result<MessageId> {
        let message_id = envelope.message_id;
        tracing::debug!(
            saga_id = %self.saga_id,
            message_id = %message_id,
            parent_message_id = %self.message.message_id,
            message_type = %envelope.message_type,
            route = ?route,
            "Dispatching outgoing message"
        );
        match route {
            Route::Send => self.runtime.bus().send(envelope).await?,
            Route::Publish => self.runtime.bus().publish(envelope).await?,
        }
        Ok(message_id)
    }

    /// Key of the step `S` for this handler and message.
    pub fn step_key<S: Message>(&self) -> StepKey {
        self.step_key_for(S::MESSAGE_TYPE)
    }

    /// Key of the step named `step_type` for this handler and message.
    pub fn step_key_for(&self, step_type: &str) -> StepKey {
        StepKey::new(
            self.saga_id,
            step_type,
            self.handler_type.as_str(),
            self.message.message_id,
        )
    }

    /// Records step `S` as started.
    pub async fn mark_as_started<S: Message>(&self) -> Result<LogOutcome> {
        self.mark_step(S::MESSAGE_TYPE, StepStatus::Started, None)
            .await
    }

    /// Records step `S` as completed. Refused once cancelled.
    pub async fn mark_as_complete<S: Message>(&self) -> Result<LogOutcome> {
        self.mark_step(S::MESSAGE_TYPE, StepStatus::Completed, None)
            .await
    }

    /// Records step `S` as failed with `failure`.
    pub async fn mark_as_failed<S: Message>(&self, failure: FailureInfo) -> Result<LogOutcome> {
        self.mark_step(S::MESSAGE_TYPE, StepStatus::Failed, Some(failure))
            .await
    }

    /// Records that step `S` was undone.
    pub async fn mark_as_compensated<S: Message>(&self) -> Result<LogOutcome> {
        self.mark_step(S::MESSAGE_TYPE, StepStatus::Compensated, None)
            .await
    }

    /// Records that undoing step `S` failed.
    pub async fn mark_as_compensation_failed<S: Message>(&self) -> Result<LogOutcome> {
        self.mark_step(S::MESSAGE_TYPE, StepStatus::CompensationFailed, None)
            .await
    }

    /// Writes a status for the step `step_type` of this handler and message.
    ///
    /// `Completed` and `Failed` are preceded by a `Started` record when the
    /// step has none yet. A cancelled context never writes `Completed`.
    #[tracing::instrument(
        skip(self, failure),
        fields(saga_id = %self.saga_id, handler = %self.handler_type, message_id = %self.message.message_id)
    )]
    pub async fn mark_step(
        &self,
        step_type: &str,
        status: StepStatus,
        failure: Option<FailureInfo>,
    ) -> Result<LogOutcome> {
        if status == StepStatus::Completed && self.cancellation.is_cancelled() {
            return Err(SagaError::Cancelled);
        }

        let store = self.runtime.store();
        let key = self.step_key_for(step_type);
        if matches!(status, StepStatus::Completed | StepStatus::Failed)
            && store.get_step_status(&key).await? == StepStatus::None
        {
            store
                .log_step(self.step_record(key.clone(), StepStatus::Started, None))
                .await?;
        }

        Ok(store.log_step(self.step_record(key, status, failure)).await?)
    }

    fn step_record(
        &self,
        key: StepKey,
        status: StepStatus,
        failure: Option<FailureInfo>,
    ) -> SagaStepMetadata {
        let mut builder = SagaStepMetadata::builder(key, status)
            .message_type_name(self.message.message_type.as_str())
            .application_id(self.application_id())
            .payload_raw(self.message.payload.clone());
        if let Some(parent) = self.message.parent_message_id {
            builder = builder.parent_message_id(parent);
        }
        if let Some(failure) = failure {
            builder = builder.failure(failure);
        }
        if let (StepStatus::Started, Some(claim)) = (status, &self.claim) {
            builder = builder.claim_id(claim.as_str());
        }
        builder.build()
    }

    /// The `Started` record that makes this context's dispatch own the step.
    pub(crate) fn claim_record(&self, step_type: &str) -> SagaStepMetadata {
        self.step_record(self.step_key_for(step_type), StepStatus::Started, None)
    }

    /// The `Started` record left behind when this dispatch gives the step up.
    pub(crate) fn release_record(&self, step_type: &str) -> SagaStepMetadata {
        let mut record = self.claim_record(step_type);
        record.claim_id = None;
        record
    }

    /// Returns true if this handler already finished step `S` for the current message.
    pub async fn is_already_completed<S: Message>(&self) -> Result<bool> {
        Ok(self
            .runtime
            .store()
            .is_step_completed(&self.step_key::<S>())
            .await?)
    }

    /// Marks step `S` compensated, then compensates the completed steps
    /// of the message that caused the current one.
    pub async fn compensate_and_bubble_up<S: Message>(&self) -> Result<CompensationReport> {
        self.mark_as_compensated::<S>().await?;

        let Some(parent) = self.message.parent_message_id else {
            return Ok(CompensationReport::default());
        };
        CompensationCoordinator::new(Arc::clone(&self.runtime))
            .bubble_up(
                self.saga_id,
                parent,
                self.message.correlation_id,
                self.cancellation.clone(),
            )
            .await
    }

    /// Loads this saga's data, decoding the domain fields into `T`.
    pub async fn load_saga_data<T>(&self) -> Result<Option<SagaData<T>>>
    where
        T: DeserializeOwned + Send,
    {
        Ok(self.runtime.store().load_saga_data(self.saga_id).await?)
    }

    /// Saves saga data under this context's saga id.
    pub async fn save_saga_data<T>(&self, data: &SagaData<T>) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let raw = data.to_raw()?;
        Ok(self
            .runtime
            .store()
            .save_saga_data_raw(self.saga_id, raw)
            .await?)
    }

    /// Flags the saga as completed in its saga data.
    pub async fn complete_saga(&self) -> Result<()> {
        let mut data = self.load_or_default_data().await?;
        data.mark_completed();
        self.save_saga_data(&data).await
    }

    /// Flags the saga as failed at `step_type` for this handler.
    pub async fn fail_saga(&self, step_type: &str) -> Result<()> {
        let mut data = self.load_or_default_data().await?;
        data.mark_failed(step_type, self.handler_type.as_str());
        self.save_saga_data(&data).await
    }

    async fn load_or_default_data(&self) -> Result<SagaData> {
        Ok(self
            .runtime
            .store()
            .load_saga_data_raw(self.saga_id)
            .await?
            .unwrap_or_else(|| SagaData::new(self.saga_id, serde_json::Value::Null)))
    }
}

impl std::fmt::Debug for SagaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaContext")
            .field("saga_id", &self.saga_id)
            .field("handler_type", &self.handler_type)
            .field("message_id", &self.message.message_id)
            .field("message_type", &self.message.message_type)
            .finish_non_exhaustive()
    }
}

/// A send or publish whose status write is chained after it.
///
/// Nothing happens until a terminal `then_mark_as_*` method is awaited.
/// The status is written only once the transport accepted the message,
/// so a recorded status always implies the side effect happened.
#[must_use = "a tracked operation does nothing until a then_mark_as_* method is awaited"]
pub struct TrackedOperation<'a> {
    context: &'a SagaContext,
    route: Route,
    envelope: Result<MessageEnvelope>,
}

impl TrackedOperation<'_> {
    /// Id the outgoing message will carry.
    pub fn message_id(&self) -> Option<MessageId> {
        self.envelope.as_ref().ok().map(|e| e.message_id)
    }

    /// Delivers the message, then records step `S` as completed.
    pub async fn then_mark_as_complete<S: Message>(self) -> Result<MessageId> {
        self.perform(S::MESSAGE_TYPE, StepStatus::Completed, None)
            .await
    }

    /// Delivers the message, then records step `S` as failed.
    pub async fn then_mark_as_failed<S: Message>(self, failure: FailureInfo) -> Result<MessageId> {
        self.perform(S::MESSAGE_TYPE, StepStatus::Failed, Some(failure))
            .await
    }

    /// Delivers the message, then records step `S` as compensated.
    pub async fn then_mark_as_compensated<S: Message>(self) -> Result<MessageId> {
        self.perform(S::MESSAGE_TYPE, StepStatus::Compensated, None)
            .await
    }

    /// Delivers the message, then records the compensation of step `S` as failed.
    pub async fn then_mark_as_compensation_failed<S: Message>(self) -> Result<MessageId> {
        self.perform(S::MESSAGE_TYPE, StepStatus::CompensationFailed, None)
            .await
    }

    async fn perform(
        self,
        step_type: &str,
        status: StepStatus,
        failure: Option<FailureInfo>,
    ) -> Result<MessageId> {
        if status == StepStatus::Completed && self.context.cancellation.is_cancelled() {
            return Err(SagaError::Cancelled);
        }
        let envelope = self.envelope?;
        let message_id = self.context.deliver(self.route, envelope).await?;
        self.context.mark_step(step_type, status, failure).await?;
        Ok(message_id)
    }
}
