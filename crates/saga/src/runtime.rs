//! Shared services every saga context is built from.

use std::sync::Arc;

use common::{MessageEnvelope, SagaId};
use saga_store::SagaStore;

use crate::bus::MessageBus;
use crate::cancellation::CancellationSignal;
use crate::config::SagaConfig;
use crate::context::SagaContext;
use crate::ids::{IdGenerator, UuidIdGenerator};
use crate::middleware::Pipeline;
use crate::registry::HandlerRegistry;

/// The wiring of one saga participant: store, bus, handlers and pipeline.
///
/// Built once at startup and shared behind an `Arc` by the dispatcher,
/// the coordinator and every context.
pub struct SagaRuntime {
    store: Arc<dyn SagaStore>,
    bus: Arc<dyn MessageBus>,
    ids: Arc<dyn IdGenerator>,
    registry: HandlerRegistry,
    pipeline: Pipeline,
    config: SagaConfig,
}

impl SagaRuntime {
    /// Starts wiring a runtime over a store and a bus.
    pub fn builder(store: Arc<dyn SagaStore>, bus: Arc<dyn MessageBus>) -> SagaRuntimeBuilder {
        SagaRuntimeBuilder {
            store,
            bus,
            ids: Arc::new(UuidIdGenerator),
            registry: HandlerRegistry::default(),
            pipeline: None,
            config: SagaConfig::default(),
        }
    }

    /// Step and saga data persistence.
    pub fn store(&self) -> &dyn SagaStore {
        self.store.as_ref()
    }

    /// Transport for outgoing messages.
    pub fn bus(&self) -> &dyn MessageBus {
        self.bus.as_ref()
    }

    /// Source of new saga and message ids.
    pub fn ids(&self) -> &dyn IdGenerator {
        self.ids.as_ref()
    }

    /// Handlers known to this participant.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Middleware wrapped around every handler call.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    /// Creates the context for one handler processing one message of a saga.
    pub fn load_context(
        self: &Arc<Self>,
        saga_id: SagaId,
        handler_type: impl Into<String>,
        message: MessageEnvelope,
        cancellation: CancellationSignal,
    ) -> SagaContext {
        SagaContext::new(
            Arc::clone(self),
            saga_id,
            handler_type.into(),
            message,
            cancellation,
        )
    }
}

impl std::fmt::Debug for SagaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaRuntime")
            .field("application_id", &self.config.application_id)
            .field("handlers", &self.registry.len())
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

/// Builder for [`SagaRuntime`].
pub struct SagaRuntimeBuilder {
    store: Arc<dyn SagaStore>,
    bus: Arc<dyn MessageBus>,
    ids: Arc<dyn IdGenerator>,
    registry: HandlerRegistry,
    pipeline: Option<Pipeline>,
    config: SagaConfig,
}

impl SagaRuntimeBuilder {
    /// Sets the handler registry. Defaults to an empty one.
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the random UUID id source.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Sets the engine configuration.
    pub fn config(mut self, config: SagaConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the middleware pipeline. Defaults to
    /// [`Pipeline::standard`] with the configured retry policy.
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Finishes the runtime, ready to be shared.
    pub fn build(self) -> Arc<SagaRuntime> {
        let pipeline = self
            .pipeline
            .unwrap_or_else(|| Pipeline::standard(self.config.retry.clone()));
        Arc::new(SagaRuntime {
            store: self.store,
            bus: self.bus,
            ids: self.ids,
            registry: self.registry,
            pipeline,
            config: self.config,
        })
    }
}
