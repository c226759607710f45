//! Dispatcher: routing, idempotency, failure handling and response matching.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{MessageEnvelope, MessageId, SagaId};
use saga::{
    CancellationSource, CompensationHandler, HandlerOutcome, HandlerRegistry, HandlerResult,
    ResponseHandler, SagaContext, SagaDispatcher, SagaError, SagaStepMetadata, SagaStore,
    SagaStoreExt, StartHandler, StepHandler, StepKey, StepStatus,
};
use support::{
    BookFlight, FlightBookingResult, Harness, HotelBooked, Journal, PlanTrip, TripPlanned,
};

#[derive(Clone, Default)]
struct Calls(Arc<AtomicUsize>);

impl Calls {
    fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Starts the saga and announces the plan.
struct Planner {
    calls: Calls,
}

#[async_trait]
impl StartHandler<PlanTrip> for Planner {
    async fn handle_start(&self, ctx: &SagaContext, message: PlanTrip) -> HandlerResult {
        self.calls.hit();
        ctx.publish_with_tracking(TripPlanned::new(&message.trip))
            .then_mark_as_complete::<PlanTrip>()
            .await?;
        Ok(())
    }
}

struct UndoPlan {
    journal: Journal,
}

#[async_trait]
impl CompensationHandler<PlanTrip> for UndoPlan {
    async fn compensate(&self, _ctx: &SagaContext, message: PlanTrip) -> HandlerResult {
        self.journal.push(format!("undo-plan:{}", message.trip));
        Ok(())
    }
}

/// Succeeds without recording an outcome.
struct Silent {
    calls: Calls,
}

#[async_trait]
impl StepHandler<TripPlanned> for Silent {
    async fn handle(&self, _ctx: &SagaContext, _message: TripPlanned) -> HandlerResult {
        self.calls.hit();
        Ok(())
    }
}

/// Books the hotel for a planned trip, taking its time about it.
struct SlowBooker {
    calls: Calls,
}

#[async_trait]
impl StepHandler<TripPlanned> for SlowBooker {
    async fn handle(&self, ctx: &SagaContext, message: TripPlanned) -> HandlerResult {
        if ctx.is_already_completed::<TripPlanned>().await? {
            return Ok(());
        }
        self.calls.hit();
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.publish_with_tracking(HotelBooked::new(&message.trip))
            .then_mark_as_complete::<TripPlanned>()
            .await?;
        Ok(())
    }
}

struct Broken;

#[async_trait]
impl StepHandler<TripPlanned> for Broken {
    async fn handle(&self, _ctx: &SagaContext, _message: TripPlanned) -> HandlerResult {
        Err(SagaError::handler("no cars left"))
    }
}

/// Fails transiently for the first `failures` calls.
struct Flaky {
    calls: Calls,
    failures: usize,
}

#[async_trait]
impl StepHandler<TripPlanned> for Flaky {
    async fn handle(&self, ctx: &SagaContext, _message: TripPlanned) -> HandlerResult {
        if self.calls.hit() <= self.failures {
            return Err(SagaError::transient("broker hiccup"));
        }
        ctx.mark_as_complete::<TripPlanned>().await?;
        Ok(())
    }
}

/// Answers flight bookings.
struct FlightDesk {
    confirm: bool,
}

#[async_trait]
impl StepHandler<BookFlight> for FlightDesk {
    async fn handle(&self, ctx: &SagaContext, message: BookFlight) -> HandlerResult {
        ctx.respond(FlightBookingResult {
            trip: message.trip,
            confirmed: self.confirm,
        })
        .await?;
        ctx.mark_as_complete::<BookFlight>().await?;
        Ok(())
    }
}

struct FlightResult {
    journal: Journal,
}

#[async_trait]
impl ResponseHandler<FlightBookingResult> for FlightResult {
    async fn handle_success_response(
        &self,
        ctx: &SagaContext,
        response: FlightBookingResult,
    ) -> HandlerResult {
        self.journal.push(format!("confirmed:{}", response.trip));
        ctx.mark_as_complete::<FlightBookingResult>().await?;
        Ok(())
    }

    async fn handle_fail_response(
        &self,
        ctx: &SagaContext,
        response: FlightBookingResult,
    ) -> HandlerResult {
        self.journal.push(format!("rejected:{}", response.trip));
        ctx.mark_as_complete::<FlightBookingResult>().await?;
        Ok(())
    }
}

fn plan_trip() -> MessageEnvelope {
    MessageEnvelope::root(&PlanTrip::new("lisbon"), "planner").unwrap()
}

fn in_saga<M: common::Message>(message: &M, saga_id: SagaId) -> MessageEnvelope {
    MessageEnvelope::builder()
        .body(message)
        .unwrap()
        .saga_id(saga_id)
        .parent_message_id(MessageId::new())
        .build()
}

async fn status_of(
    harness: &Harness,
    envelope: &MessageEnvelope,
    saga_id: SagaId,
    handler: &str,
) -> StepStatus {
    let key = StepKey::new(
        saga_id,
        envelope.message_type.as_str(),
        handler,
        envelope.message_id,
    );
    harness.store.get_step_status(&key).await.unwrap()
}

#[tokio::test]
async fn test_start_message_begins_new_saga() {
    let calls = Calls::default();
    let registry = HandlerRegistry::builder()
        .start::<PlanTrip, _>("Planner", Planner { calls: calls.clone() })
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let envelope = plan_trip();

    let report = dispatcher.dispatch(envelope.clone()).await.unwrap();

    assert_eq!(report.outcome_of("Planner"), Some(&HandlerOutcome::Handled));
    assert_eq!(calls.get(), 1);
    assert_eq!(
        status_of(&harness, &envelope, report.saga_id, "Planner").await,
        StepStatus::Completed
    );
    let published = harness.bus.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].saga_id, Some(report.saga_id));
}

#[tokio::test]
async fn test_redelivered_message_is_skipped() {
    let calls = Calls::default();
    let registry = HandlerRegistry::builder()
        .step::<TripPlanned, _>("Silent", Silent { calls: calls.clone() })
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let envelope = in_saga(&TripPlanned::new("lisbon"), SagaId::new());

    let first = dispatcher.dispatch(envelope.clone()).await.unwrap();
    let second = dispatcher.dispatch(envelope.clone()).await.unwrap();

    assert_eq!(first.outcome_of("Silent"), Some(&HandlerOutcome::Handled));
    assert_eq!(second.outcome_of("Silent"), Some(&HandlerOutcome::Skipped));
    assert_eq!(calls.get(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_runs_handler_once() {
    let calls = Calls::default();
    let registry = HandlerRegistry::builder()
        .step::<TripPlanned, _>("SlowBooker", SlowBooker { calls: calls.clone() })
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let saga_id = SagaId::new();
    let envelope = in_saga(&TripPlanned::new("lisbon"), saga_id);

    let (first, second) = tokio::join!(
        dispatcher.dispatch(envelope.clone()),
        dispatcher.dispatch(envelope.clone())
    );

    let outcomes: Vec<_> = [first.unwrap(), second.unwrap()]
        .iter()
        .map(|report| report.outcome_of("SlowBooker").cloned().unwrap())
        .collect();
    assert_eq!(
        outcomes.iter().filter(|o| **o == HandlerOutcome::Handled).count(),
        1
    );
    assert_eq!(
        outcomes.iter().filter(|o| **o == HandlerOutcome::Skipped).count(),
        1
    );
    assert_eq!(calls.get(), 1);
    assert_eq!(harness.bus.published().len(), 1);
    assert_eq!(harness.journal.count("publish:HotelBooked"), 1);
    assert_eq!(
        status_of(&harness, &envelope, saga_id, "SlowBooker").await,
        StepStatus::Completed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_redeliveries_have_one_execution() {
    let calls = Calls::default();
    let registry = HandlerRegistry::builder()
        .step::<TripPlanned, _>("SlowBooker", SlowBooker { calls: calls.clone() })
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let envelope = in_saga(&TripPlanned::new("porto"), SagaId::new());

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            let envelope = envelope.clone();
            tokio::spawn(async move { dispatcher.dispatch(envelope).await })
        })
        .collect();
    let mut handled = 0;
    for task in tasks {
        let report = task.await.unwrap().unwrap();
        if report.outcome_of("SlowBooker") == Some(&HandlerOutcome::Handled) {
            handled += 1;
        }
    }

    assert_eq!(handled, 1);
    assert_eq!(calls.get(), 1);
    assert_eq!(harness.bus.published().len(), 1);
}

fn started_by(
    envelope: &MessageEnvelope,
    saga_id: SagaId,
    handler: &str,
    claim: &str,
    age: chrono::Duration,
) -> SagaStepMetadata {
    let key = StepKey::new(
        saga_id,
        envelope.message_type.as_str(),
        handler,
        envelope.message_id,
    );
    SagaStepMetadata::builder(key, StepStatus::Started)
        .message_type_name(envelope.message_type.as_str())
        .application_id("travel")
        .claim_id(claim)
        .recorded_at(Utc::now() - age)
        .build()
}

#[tokio::test]
async fn test_step_left_by_crashed_dispatch_is_reclaimed() {
    let calls = Calls::default();
    let registry = HandlerRegistry::builder()
        .step::<TripPlanned, _>("Silent", Silent { calls: calls.clone() })
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let saga_id = SagaId::new();
    let envelope = in_saga(&TripPlanned::new("lisbon"), saga_id);
    harness
        .store
        .log_step(started_by(
            &envelope,
            saga_id,
            "Silent",
            "crashed",
            chrono::Duration::minutes(10),
        ))
        .await
        .unwrap();

    let report = dispatcher.dispatch(envelope.clone()).await.unwrap();

    assert_eq!(report.outcome_of("Silent"), Some(&HandlerOutcome::Handled));
    assert_eq!(calls.get(), 1);
    assert_eq!(
        harness.journal.entries(),
        vec!["reclaim:Started", "log:Completed"]
    );
    assert_eq!(
        status_of(&harness, &envelope, saga_id, "Silent").await,
        StepStatus::Completed
    );
}

#[tokio::test]
async fn test_step_owned_by_live_dispatch_is_skipped() {
    let calls = Calls::default();
    let registry = HandlerRegistry::builder()
        .step::<TripPlanned, _>("Silent", Silent { calls: calls.clone() })
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let saga_id = SagaId::new();
    let envelope = in_saga(&TripPlanned::new("lisbon"), saga_id);
    harness
        .store
        .log_step(started_by(
            &envelope,
            saga_id,
            "Silent",
            "in-flight",
            chrono::Duration::zero(),
        ))
        .await
        .unwrap();

    let report = dispatcher.dispatch(envelope.clone()).await.unwrap();

    assert_eq!(report.outcome_of("Silent"), Some(&HandlerOutcome::Skipped));
    assert_eq!(calls.get(), 0);
    assert!(harness.journal.entries().is_empty());
    let owner = harness
        .store
        .get_step(&StepKey::new(saga_id, "TripPlanned", "Silent", envelope.message_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(owner.claim_id.as_deref(), Some("in-flight"));
}

#[tokio::test]
async fn test_handler_that_does_not_mark_is_completed() {
    let registry = HandlerRegistry::builder()
        .step::<TripPlanned, _>("Silent", Silent { calls: Calls::default() })
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let saga_id = SagaId::new();
    let envelope = in_saga(&TripPlanned::new("lisbon"), saga_id);

    dispatcher.dispatch(envelope.clone()).await.unwrap();

    assert_eq!(
        status_of(&harness, &envelope, saga_id, "Silent").await,
        StepStatus::Completed
    );
    assert_eq!(harness.journal.entries(), vec!["log:Started", "log:Completed"]);
}

#[tokio::test]
async fn test_saga_id_is_read_from_header() {
    let registry = HandlerRegistry::builder()
        .step::<TripPlanned, _>("Silent", Silent { calls: Calls::default() })
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let saga_id = SagaId::new();
    let envelope = MessageEnvelope::builder()
        .body(&TripPlanned::new("lisbon"))
        .unwrap()
        .header(common::headers::SAGA_ID_HEADER, saga_id.to_string())
        .build();

    let report = dispatcher.dispatch(envelope).await.unwrap();

    assert_eq!(report.saga_id, saga_id);
}

#[tokio::test]
async fn test_step_message_without_saga_id_is_rejected() {
    let registry = HandlerRegistry::builder()
        .step::<TripPlanned, _>("Silent", Silent { calls: Calls::default() })
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let envelope = MessageEnvelope::root(&TripPlanned::new("lisbon"), "planner").unwrap();

    let result = dispatcher.dispatch(envelope).await;

    assert!(matches!(result, Err(SagaError::HandlerResolution(_))));
    assert_eq!(harness.store.step_count().await, 0);
}

#[tokio::test]
async fn test_invalid_saga_id_header_is_rejected() {
    let registry = HandlerRegistry::builder()
        .step::<TripPlanned, _>("Silent", Silent { calls: Calls::default() })
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let envelope = MessageEnvelope::builder()
        .body(&TripPlanned::new("lisbon"))
        .unwrap()
        .header(common::headers::SAGA_ID_HEADER, "not-a-uuid")
        .build();

    let result = dispatcher.dispatch(envelope).await;

    assert!(matches!(result, Err(SagaError::HandlerResolution(_))));
}

#[tokio::test]
async fn test_unknown_message_type_is_rejected() {
    let harness = Harness::new(HandlerRegistry::default());
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());

    let result = dispatcher.dispatch(plan_trip()).await;

    assert!(matches!(result, Err(SagaError::HandlerResolution(_))));
}

#[tokio::test]
async fn test_non_start_handler_of_start_message_is_reported_failed() {
    let registry = HandlerRegistry::builder()
        .start::<PlanTrip, _>("Planner", Planner { calls: Calls::default() })
        .step::<PlanTrip, _>("Auditor", AuditPlan)
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());

    let report = dispatcher.dispatch(plan_trip()).await.unwrap();

    assert_eq!(report.outcome_of("Planner"), Some(&HandlerOutcome::Handled));
    assert!(matches!(
        report.outcome_of("Auditor"),
        Some(HandlerOutcome::Failed {
            error_type: "HandlerResolutionFailure",
            ..
        })
    ));
}

struct AuditPlan;

#[async_trait]
impl StepHandler<PlanTrip> for AuditPlan {
    async fn handle(&self, _ctx: &SagaContext, _message: PlanTrip) -> HandlerResult {
        Ok(())
    }
}

#[tokio::test]
async fn test_failing_handler_marks_step_and_compensates_earlier_steps() {
    let journal = Journal::default();
    let registry = HandlerRegistry::builder()
        .start::<PlanTrip, _>("Planner", Planner { calls: Calls::default() })
        .compensation::<PlanTrip, _>(
            "CancelPlan",
            UndoPlan {
                journal: journal.clone(),
            },
        )
        .step::<TripPlanned, _>("CarHandler", Broken)
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());

    let start = plan_trip();
    let started = dispatcher.dispatch(start.clone()).await.unwrap();
    let saga_id = started.saga_id;
    let planned = harness.bus.published().remove(0);

    let report = dispatcher.dispatch(planned.clone()).await.unwrap();

    let car = &report.handlers[0];
    assert!(matches!(
        &car.outcome,
        HandlerOutcome::Failed { error_type: "HandlerFailure", reason } if reason.contains("no cars left")
    ));
    let compensation = car.compensation.as_ref().unwrap();
    assert_eq!(compensation.compensated.len(), 1);
    assert_eq!(journal.entries(), vec!["undo-plan:lisbon"]);

    assert_eq!(
        status_of(&harness, &planned, saga_id, "CarHandler").await,
        StepStatus::Failed
    );
    assert_eq!(
        status_of(&harness, &start, saga_id, "Planner").await,
        StepStatus::Compensated
    );

    let data = harness
        .store
        .load_saga_data::<serde_json::Value>(saga_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data.failed_step_type.as_deref(), Some("TripPlanned"));
    assert_eq!(data.failed_handler_type.as_deref(), Some("CarHandler"));
}

#[tokio::test]
async fn test_compensation_can_be_disabled() {
    let journal = Journal::default();
    let registry = HandlerRegistry::builder()
        .start::<PlanTrip, _>("Planner", Planner { calls: Calls::default() })
        .compensation::<PlanTrip, _>(
            "CancelPlan",
            UndoPlan {
                journal: journal.clone(),
            },
        )
        .step::<TripPlanned, _>("CarHandler", Broken)
        .build()
        .unwrap();
    let harness = Harness::with_config(
        registry,
        support::fast_config().with_compensate_on_failure(false),
    );
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());

    dispatcher.dispatch(plan_trip()).await.unwrap();
    let planned = harness.bus.published().remove(0);
    let report = dispatcher.dispatch(planned).await.unwrap();

    assert!(report.handlers[0].compensation.is_none());
    assert!(journal.entries().is_empty());
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let calls = Calls::default();
    let registry = HandlerRegistry::builder()
        .step::<TripPlanned, _>(
            "Flaky",
            Flaky {
                calls: calls.clone(),
                failures: 2,
            },
        )
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let saga_id = SagaId::new();
    let envelope = in_saga(&TripPlanned::new("lisbon"), saga_id);

    let report = dispatcher.dispatch(envelope.clone()).await.unwrap();

    assert_eq!(report.outcome_of("Flaky"), Some(&HandlerOutcome::Handled));
    assert_eq!(calls.get(), 3);
    assert_eq!(
        status_of(&harness, &envelope, saga_id, "Flaky").await,
        StepStatus::Completed
    );
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_step() {
    let calls = Calls::default();
    let registry = HandlerRegistry::builder()
        .step::<TripPlanned, _>(
            "Flaky",
            Flaky {
                calls: calls.clone(),
                failures: 10,
            },
        )
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let saga_id = SagaId::new();
    let envelope = in_saga(&TripPlanned::new("lisbon"), saga_id);

    let report = dispatcher.dispatch(envelope.clone()).await.unwrap();

    assert!(matches!(
        report.outcome_of("Flaky"),
        Some(HandlerOutcome::Failed {
            error_type: "TransientInfrastructureFailure",
            ..
        })
    ));
    assert_eq!(calls.get(), 3);
    assert_eq!(
        status_of(&harness, &envelope, saga_id, "Flaky").await,
        StepStatus::Failed
    );
}

#[tokio::test]
async fn test_event_fans_out_to_every_handler() {
    let registry = HandlerRegistry::builder()
        .step::<TripPlanned, _>("Silent", Silent { calls: Calls::default() })
        .step::<TripPlanned, _>(
            "Flaky",
            Flaky {
                calls: Calls::default(),
                failures: 0,
            },
        )
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let saga_id = SagaId::new();
    let envelope = in_saga(&TripPlanned::new("lisbon"), saga_id);

    let report = dispatcher.dispatch(envelope.clone()).await.unwrap();

    assert_eq!(report.handlers.len(), 2);
    assert_eq!(report.count(|o| *o == HandlerOutcome::Handled), 2);
    for handler in ["Silent", "Flaky"] {
        assert_eq!(
            status_of(&harness, &envelope, saga_id, handler).await,
            StepStatus::Completed
        );
    }
}

#[tokio::test]
async fn test_handler_filter_restricts_dispatch() {
    let silent_calls = Calls::default();
    let registry = HandlerRegistry::builder()
        .step::<TripPlanned, _>(
            "Silent",
            Silent {
                calls: silent_calls.clone(),
            },
        )
        .step::<TripPlanned, _>("CarHandler", Broken)
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let envelope = in_saga(&TripPlanned::new("lisbon"), SagaId::new());

    let report = dispatcher
        .dispatch_with(envelope, Some("Silent"), Default::default())
        .await
        .unwrap();

    assert_eq!(report.handlers.len(), 1);
    assert_eq!(report.outcome_of("Silent"), Some(&HandlerOutcome::Handled));
    assert_eq!(silent_calls.get(), 1);
}

#[tokio::test]
async fn test_cancelled_dispatch_is_rerun_on_redelivery() {
    let calls = Calls::default();
    let registry = HandlerRegistry::builder()
        .start::<PlanTrip, _>("Planner", Planner { calls: calls.clone() })
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let source = CancellationSource::new();
    source.cancel();
    let saga_id = SagaId::new();
    let envelope = in_saga(&PlanTrip::new("lisbon"), saga_id);

    let report = dispatcher
        .dispatch_with(envelope.clone(), None, source.signal())
        .await
        .unwrap();

    assert_eq!(report.outcome_of("Planner"), Some(&HandlerOutcome::Cancelled));
    assert!(harness.bus.published().is_empty());
    assert_eq!(
        status_of(&harness, &envelope, saga_id, "Planner").await,
        StepStatus::Started
    );

    let redelivered = dispatcher.dispatch(envelope.clone()).await.unwrap();

    assert_eq!(
        redelivered.outcome_of("Planner"),
        Some(&HandlerOutcome::Handled)
    );
    assert_eq!(calls.get(), 2);
    assert_eq!(harness.bus.published().len(), 1);
    assert_eq!(
        status_of(&harness, &envelope, saga_id, "Planner").await,
        StepStatus::Completed
    );
}

fn flight_registry(journal: &Journal, confirm: bool) -> HandlerRegistry {
    HandlerRegistry::builder()
        .step::<BookFlight, _>("FlightDesk", FlightDesk { confirm })
        .response::<FlightBookingResult, _>(
            "FlightResult",
            FlightResult {
                journal: journal.clone(),
            },
        )
        .start::<PlanTrip, _>("Planner", Planner { calls: Calls::default() })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_response_is_routed_by_outcome() {
    for (confirm, expected) in [(true, "confirmed:lisbon"), (false, "rejected:lisbon")] {
        let journal = Journal::default();
        let harness = Harness::new(flight_registry(&journal, confirm));
        let dispatcher = SagaDispatcher::new(harness.runtime.clone());
        let saga_id = SagaId::new();
        let request = in_saga(&BookFlight::new("lisbon"), saga_id);

        dispatcher.dispatch(request.clone()).await.unwrap();
        let response = harness.bus.sent().remove(0);
        assert_eq!(response.parent_message_id, Some(request.message_id));

        let report = dispatcher.dispatch(response).await.unwrap();

        assert_eq!(
            report.outcome_of("FlightResult"),
            Some(&HandlerOutcome::Handled)
        );
        assert_eq!(journal.entries(), vec![expected]);
    }
}

#[tokio::test]
async fn test_response_to_untracked_request_is_accepted() {
    let journal = Journal::default();
    let harness = Harness::new(flight_registry(&journal, true));
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let response = in_saga(
        &FlightBookingResult {
            trip: "porto".to_string(),
            confirmed: true,
        },
        SagaId::new(),
    );

    dispatcher.dispatch(response).await.unwrap();

    assert_eq!(journal.entries(), vec!["confirmed:porto"]);
}

#[tokio::test]
async fn test_response_to_other_request_type_is_rejected() {
    let journal = Journal::default();
    let harness = Harness::new(flight_registry(&journal, true));
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());

    let start = plan_trip();
    let report = dispatcher.dispatch(start.clone()).await.unwrap();
    let response = MessageEnvelope::builder()
        .body(&FlightBookingResult {
            trip: "lisbon".to_string(),
            confirmed: true,
        })
        .unwrap()
        .saga_id(report.saga_id)
        .parent_message_id(start.message_id)
        .build();

    let result = dispatcher.dispatch(response).await;

    assert!(matches!(result, Err(SagaError::HandlerResolution(_))));
    assert!(journal.entries().is_empty());
}

#[tokio::test]
async fn test_response_without_parent_is_rejected() {
    let journal = Journal::default();
    let harness = Harness::new(flight_registry(&journal, true));
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let response = MessageEnvelope::builder()
        .body(&FlightBookingResult {
            trip: "lisbon".to_string(),
            confirmed: true,
        })
        .unwrap()
        .saga_id(SagaId::new())
        .build();

    let result = dispatcher.dispatch(response).await;

    assert!(matches!(result, Err(SagaError::HandlerResolution(_))));
}

#[tokio::test]
async fn test_undecodable_payload_is_dead_letter_error() {
    let registry = HandlerRegistry::builder()
        .step::<TripPlanned, _>("Silent", Silent { calls: Calls::default() })
        .build()
        .unwrap();
    let harness = Harness::new(registry);
    let dispatcher = SagaDispatcher::new(harness.runtime.clone());
    let saga_id = SagaId::new();
    let envelope = MessageEnvelope::builder()
        .message_type("TripPlanned", common::MessageKind::Event)
        .payload_raw(serde_json::json!({ "unexpected": 1 }))
        .saga_id(saga_id)
        .build();

    let result = dispatcher.dispatch(envelope.clone()).await;

    let error = result.unwrap_err();
    assert!(error.is_dead_letter());
    assert_eq!(
        status_of(&harness, &envelope, saga_id, "Silent").await,
        StepStatus::Failed
    );
}
