//! Shared messages, handlers and recording adapters for saga tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{Command, Event, Message, MessageEnvelope, MessageKind, Response};
use saga::{
    BusError, HandlerRegistry, InMemoryBus, InMemorySagaStore, LogOutcome, MessageBus,
    MessageStream, RetryPolicy, SagaConfig, SagaData, SagaRuntime, SagaStepMetadata, SagaStore,
    StepKey,
};
use serde::{Deserialize, Serialize};

macro_rules! test_message {
    ($name:ident, $kind:ident, $marker:ident) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            pub trip: String,
        }

        impl $name {
            pub fn new(trip: &str) -> Self {
                Self {
                    trip: trip.to_string(),
                }
            }
        }

        impl Message for $name {
            const MESSAGE_TYPE: &'static str = stringify!($name);
            const KIND: MessageKind = MessageKind::$kind;
        }

        impl $marker for $name {}
    };
}

test_message!(PlanTrip, Command, Command);
test_message!(TripPlanned, Event, Event);
test_message!(BookHotel, Command, Command);
test_message!(HotelBooked, Event, Event);
test_message!(BookFlight, Command, Command);
test_message!(RentCar, Command, Command);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightBookingResult {
    pub trip: String,
    pub confirmed: bool,
}

impl Message for FlightBookingResult {
    const MESSAGE_TYPE: &'static str = "FlightBookingResult";
    const KIND: MessageKind = MessageKind::Response;
}

impl Response for FlightBookingResult {
    type Request = BookFlight;

    fn is_success(&self) -> bool {
        self.confirmed
    }
}

/// Ordered log of side effects shared by the recording adapters and handlers.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Store wrapper journaling every status write as `log:<Status>`.
#[derive(Clone)]
pub struct RecordingStore {
    pub inner: InMemorySagaStore,
    pub journal: Journal,
}

#[async_trait]
impl SagaStore for RecordingStore {
    async fn log_step(&self, record: SagaStepMetadata) -> saga_store::Result<LogOutcome> {
        let status = record.status;
        let outcome = self.inner.log_step(record).await?;
        if outcome == LogOutcome::Recorded {
            self.journal.push(format!("log:{status}"));
        }
        Ok(outcome)
    }

    async fn reclaim_step(
        &self,
        record: SagaStepMetadata,
        stale_claim: Option<&str>,
    ) -> saga_store::Result<bool> {
        let reclaimed = self.inner.reclaim_step(record, stale_claim).await?;
        if reclaimed {
            self.journal.push("reclaim:Started");
        }
        Ok(reclaimed)
    }

    async fn get_step(&self, key: &StepKey) -> saga_store::Result<Option<SagaStepMetadata>> {
        self.inner.get_step(key).await
    }

    async fn get_saga_steps(
        &self,
        saga_id: common::SagaId,
    ) -> saga_store::Result<Vec<SagaStepMetadata>> {
        self.inner.get_saga_steps(saga_id).await
    }

    async fn load_saga_data_raw(
        &self,
        saga_id: common::SagaId,
    ) -> saga_store::Result<Option<SagaData>> {
        self.inner.load_saga_data_raw(saga_id).await
    }

    async fn save_saga_data_raw(
        &self,
        saga_id: common::SagaId,
        data: SagaData,
    ) -> saga_store::Result<()> {
        self.inner.save_saga_data_raw(saga_id, data).await
    }
}

/// Bus wrapper journaling every accepted message as `send:<Type>` / `publish:<Type>`.
#[derive(Clone)]
pub struct RecordingBus {
    pub inner: InMemoryBus,
    pub journal: Journal,
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn send(&self, envelope: MessageEnvelope) -> Result<(), BusError> {
        let entry = format!("send:{}", envelope.message_type);
        self.inner.send(envelope).await?;
        self.journal.push(entry);
        Ok(())
    }

    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), BusError> {
        let entry = format!("publish:{}", envelope.message_type);
        self.inner.publish(envelope).await?;
        self.journal.push(entry);
        Ok(())
    }

    async fn consume(&self) -> Result<MessageStream, BusError> {
        self.inner.consume().await
    }
}

/// Runtime wired to recording in-memory adapters.
pub struct Harness {
    pub runtime: Arc<SagaRuntime>,
    pub store: InMemorySagaStore,
    pub bus: InMemoryBus,
    pub journal: Journal,
}

impl Harness {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self::with_config(registry, fast_config())
    }

    pub fn with_config(registry: HandlerRegistry, config: SagaConfig) -> Self {
        let journal = Journal::default();
        let store = InMemorySagaStore::new();
        let bus = InMemoryBus::new();
        let runtime = SagaRuntime::builder(
            Arc::new(RecordingStore {
                inner: store.clone(),
                journal: journal.clone(),
            }),
            Arc::new(RecordingBus {
                inner: bus.clone(),
                journal: journal.clone(),
            }),
        )
        .registry(registry)
        .config(config)
        .build();

        Self {
            runtime,
            store,
            bus,
            journal,
        }
    }
}

/// Config with millisecond backoff so retry tests stay fast.
pub fn fast_config() -> SagaConfig {
    SagaConfig::new("travel").with_retry(RetryPolicy::new(
        3,
        Duration::from_millis(1),
        Duration::from_millis(5),
    ))
}
