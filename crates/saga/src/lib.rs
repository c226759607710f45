//! Saga coordination engine.
//!
//! A saga is a long-running business transaction spread across services
//! that talk over a message bus. Every handler execution is tracked as a
//! step in a [`SagaStore`]; the step state machine makes redelivered
//! messages idempotent, and the [`CompensationCoordinator`] undoes
//! completed steps in reverse order when one of them fails.
//!
//! The moving parts:
//! 1. [`HandlerRegistry`]: explicit registration of start, step, response and compensation handlers
//! 2. [`SagaDispatcher`]: idempotency check, `Started` record, middleware pipeline, failure path
//! 3. [`SagaContext`]: fluent send/publish-then-mark operations for handlers
//! 4. [`Pipeline`]: retry, logging and tracing around every handler call
//! 5. [`SagaConsumer`]: bus consumer loop with ack/nack semantics

pub mod bus;
pub mod cancellation;
pub mod causal;
pub mod config;
pub mod consumer;
pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod ids;
pub mod middleware;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod trace_context;

pub use bus::{BusError, Delivery, DeliveryOutcome, InMemoryBus, MessageBus, MessageStream};
pub use cancellation::{CancellationSignal, CancellationSource};
pub use causal::CausalGraph;
pub use config::SagaConfig;
pub use consumer::SagaConsumer;
pub use context::{SagaContext, TrackedOperation};
pub use coordinator::{CompensationCoordinator, CompensationReport};
pub use dispatcher::{DispatchReport, HandlerOutcome, HandlerReport, SagaDispatcher};
pub use error::{Result, SagaError};
pub use handler::{
    CompensationHandler, HandlerResult, HandlerRole, ResponseHandler, StartHandler, StepHandler,
};
pub use ids::{IdGenerator, UuidIdGenerator};
pub use middleware::{Middleware, Next, Pipeline};
pub use registry::{HandlerBinding, HandlerRegistry, HandlerRegistryBuilder};
pub use retry::{RetryEvent, RetryObserver, RetryPolicy};
pub use runtime::{SagaRuntime, SagaRuntimeBuilder};
pub use trace_context::TraceContext;

pub use saga_store::{
    FailureInfo, InMemorySagaStore, LogOutcome, SagaData, SagaStepMetadata, SagaStore,
    SagaStoreExt, StepKey, StepStatus,
};
