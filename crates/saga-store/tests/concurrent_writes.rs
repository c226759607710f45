//! Concurrency tests for step status writes.

use std::sync::Arc;

use common::{MessageId, SagaId};
use saga_store::{
    FailureInfo, InMemorySagaStore, LogOutcome, SagaStepMetadata, SagaStore, StepKey, StepStatus,
    StoreError,
};

fn record(key: &StepKey, status: StepStatus) -> SagaStepMetadata {
    SagaStepMetadata::builder(key.clone(), status)
        .message_type_name("OrderCreated")
        .application_id("inventory")
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_started_writes_record_once() {
    let store = Arc::new(InMemorySagaStore::new());
    let key = StepKey::new(SagaId::new(), "OrderCreated", "ReserveStock", MessageId::new());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let store = Arc::clone(&store);
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            store.log_step(record(&key, StepStatus::Started)).await
        }));
    }

    let mut recorded = 0;
    let mut replayed = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            LogOutcome::Recorded => recorded += 1,
            LogOutcome::Replayed => replayed += 1,
        }
    }

    assert_eq!(recorded, 1);
    assert_eq!(replayed, 15);
    assert_eq!(store.step_count().await, 1);
}

fn claim(key: &StepKey, claim_id: String) -> SagaStepMetadata {
    SagaStepMetadata::builder(key.clone(), StepStatus::Started)
        .message_type_name("OrderCreated")
        .application_id("inventory")
        .claim_id(claim_id)
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_claims_have_exactly_one_owner() {
    let store = Arc::new(InMemorySagaStore::new());
    let key = StepKey::new(SagaId::new(), "OrderCreated", "ReserveStock", MessageId::new());

    let mut tasks = Vec::new();
    for i in 0..16 {
        let store = Arc::clone(&store);
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            store.log_step(claim(&key, format!("dispatch-{i}"))).await
        }));
    }

    let mut owners = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(LogOutcome::Recorded) => owners += 1,
            Err(StoreError::IllegalStepTransition { .. }) => rejected += 1,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert_eq!(owners, 1);
    assert_eq!(rejected, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_reclaims_have_exactly_one_owner() {
    let store = Arc::new(InMemorySagaStore::new());
    let key = StepKey::new(SagaId::new(), "OrderCreated", "ReserveStock", MessageId::new());
    store
        .log_step(claim(&key, "crashed".to_string()))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            store
                .reclaim_step(claim(&key, format!("dispatch-{i}")), Some("crashed"))
                .await
        }));
    }

    let mut owners = 0;
    for task in tasks {
        if task.await.unwrap().unwrap() {
            owners += 1;
        }
    }

    assert_eq!(owners, 1);
    let owner = store.get_step(&key).await.unwrap().unwrap();
    assert!(owner.claim_id.unwrap().starts_with("dispatch-"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminal_race_has_exactly_one_winner() {
    let store = Arc::new(InMemorySagaStore::new());
    let key = StepKey::new(SagaId::new(), "OrderCreated", "ReserveStock", MessageId::new());
    store
        .log_step(record(&key, StepStatus::Started))
        .await
        .unwrap();

    let completer = {
        let store = Arc::clone(&store);
        let key = key.clone();
        tokio::spawn(async move { store.log_step(record(&key, StepStatus::Completed)).await })
    };
    let failer = {
        let store = Arc::clone(&store);
        let key = key.clone();
        tokio::spawn(async move {
            let failed = SagaStepMetadata::builder(key, StepStatus::Failed)
                .message_type_name("OrderCreated")
                .application_id("inventory")
                .failure(FailureInfo::new("timeout"))
                .build();
            store.log_step(failed).await
        })
    };

    let results = [completer.await.unwrap(), failer.await.unwrap()];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    let losers = results
        .iter()
        .filter(|r| matches!(r, Err(StoreError::IllegalStepTransition { .. })))
        .count();

    assert_eq!(winners, 1);
    assert_eq!(losers, 1);

    let status = store.get_step_status(&key).await.unwrap();
    assert!(matches!(status, StepStatus::Completed | StepStatus::Failed));
}

#[tokio::test]
async fn test_fan_out_handlers_are_tracked_independently() {
    let store = InMemorySagaStore::new();
    let saga_id = SagaId::new();
    let message_id = MessageId::new();
    let stock = StepKey::new(saga_id, "OrderCreated", "ReserveStock", message_id);
    let email = StepKey::new(saga_id, "OrderCreated", "SendConfirmation", message_id);

    for status in [StepStatus::Started, StepStatus::Completed] {
        store.log_step(record(&stock, status)).await.unwrap();
    }
    store
        .log_step(record(&email, StepStatus::Started))
        .await
        .unwrap();

    assert!(store.is_step_completed(&stock).await.unwrap());
    assert!(!store.is_step_completed(&email).await.unwrap());
    assert_eq!(store.get_saga_steps(saga_id).await.unwrap().len(), 2);
}
