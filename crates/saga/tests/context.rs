//! Saga context: outgoing message stamping and send-then-mark ordering.

mod support;

use common::headers::{SAGA_ID_HEADER, TRACEPARENT_HEADER};
use common::{MessageEnvelope, SagaId};
use saga::{
    CancellationSignal, CancellationSource, FailureInfo, HandlerRegistry, LogOutcome, SagaData,
    SagaError, SagaStore, StepStatus,
};
use support::{BookHotel, Harness, HotelBooked, PlanTrip, TripPlanned};

fn inbound() -> MessageEnvelope {
    MessageEnvelope::root(&PlanTrip::new("lisbon"), "planner").unwrap()
}

#[tokio::test]
async fn test_outgoing_messages_carry_causation() {
    let harness = Harness::new(HandlerRegistry::default());
    let saga_id = SagaId::new();
    let message = inbound();
    let ctx = harness.runtime.load_context(
        saga_id,
        "PlanTripHandler",
        message.clone(),
        CancellationSignal::never(),
    );

    let sent_id = ctx.send(BookHotel::new("lisbon")).await.unwrap();

    let sent = harness.bus.sent();
    assert_eq!(sent.len(), 1);
    let out = &sent[0];
    assert_eq!(out.message_id, sent_id);
    assert_eq!(out.parent_message_id, Some(message.message_id));
    assert_eq!(out.correlation_id, message.correlation_id);
    assert_eq!(out.saga_id, Some(saga_id));
    assert_eq!(out.application_id, "travel");
    assert_eq!(out.header(SAGA_ID_HEADER), Some(saga_id.to_string().as_str()));
    assert!(out.header(TRACEPARENT_HEADER).is_some());
    assert_eq!(out.decode::<BookHotel>().unwrap(), BookHotel::new("lisbon"));
}

#[tokio::test]
async fn test_trace_id_continues_across_hops() {
    let harness = Harness::new(HandlerRegistry::default());
    let first = harness.runtime.load_context(
        SagaId::new(),
        "PlanTripHandler",
        inbound(),
        CancellationSignal::never(),
    );
    first.publish(TripPlanned::new("lisbon")).await.unwrap();

    let hop = harness.bus.published().remove(0);
    let second = harness.runtime.load_context(
        first.saga_id(),
        "HotelHandler",
        hop,
        CancellationSignal::never(),
    );

    assert_eq!(
        second.trace_context().trace_id(),
        first.trace_context().trace_id()
    );
    assert_eq!(
        second.trace_context().parent_span_id(),
        Some(first.trace_context().span_id())
    );
}

#[tokio::test]
async fn test_publish_with_tracking_publishes_before_marking() {
    let harness = Harness::new(HandlerRegistry::default());
    let ctx = harness.runtime.load_context(
        SagaId::new(),
        "PlanTripHandler",
        inbound(),
        CancellationSignal::never(),
    );
    ctx.mark_as_started::<PlanTrip>().await.unwrap();
    harness.journal.clear();

    ctx.publish_with_tracking(TripPlanned::new("lisbon"))
        .then_mark_as_complete::<PlanTrip>()
        .await
        .unwrap();

    assert_eq!(
        harness.journal.entries(),
        vec!["publish:TripPlanned", "log:Completed"]
    );
    let status = harness
        .store
        .get_step_status(&ctx.step_key::<PlanTrip>())
        .await
        .unwrap();
    assert_eq!(status, StepStatus::Completed);
}

#[tokio::test]
async fn test_failed_publish_writes_no_status() {
    let harness = Harness::new(HandlerRegistry::default());
    let ctx = harness.runtime.load_context(
        SagaId::new(),
        "PlanTripHandler",
        inbound(),
        CancellationSignal::never(),
    );
    harness.bus.set_fail_on_publish(true);

    let result = ctx
        .publish_with_tracking(TripPlanned::new("lisbon"))
        .then_mark_as_complete::<PlanTrip>()
        .await;

    assert!(matches!(result, Err(SagaError::Bus(_))));
    assert!(harness.journal.entries().is_empty());
    assert_eq!(harness.store.step_count().await, 0);
}

#[tokio::test]
async fn test_completion_without_start_records_implicit_start() {
    let harness = Harness::new(HandlerRegistry::default());
    let ctx = harness.runtime.load_context(
        SagaId::new(),
        "PlanTripHandler",
        inbound(),
        CancellationSignal::never(),
    );

    ctx.mark_as_complete::<PlanTrip>().await.unwrap();

    assert_eq!(
        harness.journal.entries(),
        vec!["log:Started", "log:Completed"]
    );
    assert!(ctx.is_already_completed::<PlanTrip>().await.unwrap());
}

#[tokio::test]
async fn test_step_record_captures_driving_message() {
    let harness = Harness::new(HandlerRegistry::default());
    let message = MessageEnvelope::builder()
        .body(&HotelBooked::new("porto"))
        .unwrap()
        .parent_message_id(common::MessageId::new())
        .build();
    let ctx = harness.runtime.load_context(
        SagaId::new(),
        "CarHandler",
        message.clone(),
        CancellationSignal::never(),
    );

    ctx.mark_as_failed::<HotelBooked>(FailureInfo::new("no cars left"))
        .await
        .unwrap();

    let record = harness
        .store
        .get_step(&ctx.step_key::<HotelBooked>())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, StepStatus::Failed);
    assert_eq!(record.handler_type, "CarHandler");
    assert_eq!(record.message_type_name, "HotelBooked");
    assert_eq!(record.parent_message_id, message.parent_message_id);
    assert_eq!(record.application_id, "travel");
    assert_eq!(record.message_payload, Some(message.payload.clone()));
    assert_eq!(record.failure_info.unwrap().reason, "no cars left");
}

#[tokio::test]
async fn test_duplicate_marks_are_replays_and_conflicts_are_rejected() {
    let harness = Harness::new(HandlerRegistry::default());
    let ctx = harness.runtime.load_context(
        SagaId::new(),
        "PlanTripHandler",
        inbound(),
        CancellationSignal::never(),
    );

    assert_eq!(
        ctx.mark_as_started::<PlanTrip>().await.unwrap(),
        LogOutcome::Recorded
    );
    assert_eq!(
        ctx.mark_as_started::<PlanTrip>().await.unwrap(),
        LogOutcome::Replayed
    );
    ctx.mark_as_complete::<PlanTrip>().await.unwrap();

    let result = ctx
        .mark_as_failed::<PlanTrip>(FailureInfo::new("too late"))
        .await;
    assert!(matches!(
        result,
        Err(SagaError::IllegalStepTransition {
            from: StepStatus::Completed,
            to: StepStatus::Failed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_cancelled_context_never_completes() {
    let harness = Harness::new(HandlerRegistry::default());
    let source = CancellationSource::new();
    let ctx = harness.runtime.load_context(
        SagaId::new(),
        "PlanTripHandler",
        inbound(),
        source.signal(),
    );
    ctx.mark_as_started::<PlanTrip>().await.unwrap();
    source.cancel();

    let tracked = ctx
        .publish_with_tracking(TripPlanned::new("lisbon"))
        .then_mark_as_complete::<PlanTrip>()
        .await;
    let direct = ctx.mark_as_complete::<PlanTrip>().await;

    assert!(matches!(tracked, Err(SagaError::Cancelled)));
    assert!(matches!(direct, Err(SagaError::Cancelled)));
    assert!(harness.bus.published().is_empty());
    assert_eq!(
        harness
            .store
            .get_step_status(&ctx.step_key::<PlanTrip>())
            .await
            .unwrap(),
        StepStatus::Started
    );
}

#[tokio::test]
async fn test_saga_data_lifecycle() {
    let harness = Harness::new(HandlerRegistry::default());
    let saga_id = SagaId::new();
    let ctx = harness.runtime.load_context(
        saga_id,
        "PlanTripHandler",
        inbound(),
        CancellationSignal::never(),
    );

    assert!(ctx.load_saga_data::<Vec<String>>().await.unwrap().is_none());

    ctx.save_saga_data(&SagaData::new(saga_id, vec!["lisbon".to_string()]))
        .await
        .unwrap();
    ctx.fail_saga("BookHotel").await.unwrap();

    let data = ctx.load_saga_data::<Vec<String>>().await.unwrap().unwrap();
    assert_eq!(data.data, vec!["lisbon".to_string()]);
    assert_eq!(data.failed_step_type.as_deref(), Some("BookHotel"));
    assert_eq!(data.failed_handler_type.as_deref(), Some("PlanTripHandler"));
    assert!(data.has_failed());
}
