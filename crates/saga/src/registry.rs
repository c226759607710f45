//! Static handler registry: message type name to handler bindings.
//!
//! Handlers are registered explicitly at startup under a stable name.
//! That name becomes the `handler_type` of every step record the handler
//! produces, so it must not change between deployments.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use common::{Message, MessageEnvelope, MessageKind, Response};

use crate::context::SagaContext;
use crate::error::{Result, SagaError};
use crate::handler::{
    CompensationHandler, HandlerResult, HandlerRole, ResponseHandler, StartHandler, StepHandler,
};
use crate::middleware::{Endpoint, Invocation};

/// A handler with its message type erased.
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    /// Decodes the envelope payload and calls the typed handler.
    async fn invoke(&self, ctx: &SagaContext, envelope: &MessageEnvelope) -> HandlerResult;
}

/// One registered handler for one message type.
#[derive(Clone)]
pub struct HandlerBinding {
    pub handler_type: &'static str,
    pub role: HandlerRole,
    pub message_type: &'static str,
    pub message_kind: MessageKind,
    /// For response handlers, the request type the response answers.
    pub request_type: Option<&'static str>,
    handler: Arc<dyn ErasedHandler>,
}

impl HandlerBinding {
    pub async fn invoke(&self, ctx: &SagaContext, envelope: &MessageEnvelope) -> HandlerResult {
        self.handler.invoke(ctx, envelope).await
    }
}

#[async_trait]
impl Endpoint for HandlerBinding {
    async fn call(&self, invocation: &Invocation<'_>) -> HandlerResult {
        let ctx = invocation.context();
        self.invoke(ctx, ctx.message()).await
    }
}

impl std::fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("handler_type", &self.handler_type)
            .field("role", &self.role)
            .field("message_type", &self.message_type)
            .field("request_type", &self.request_type)
            .finish_non_exhaustive()
    }
}

struct StartBinding<M, H> {
    handler: H,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, H> ErasedHandler for StartBinding<M, H>
where
    M: Message,
    H: StartHandler<M>,
{
    async fn invoke(&self, ctx: &SagaContext, envelope: &MessageEnvelope) -> HandlerResult {
        self.handler.handle_start(ctx, envelope.decode()?).await
    }
}

struct StepBinding<M, H> {
    handler: H,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, H> ErasedHandler for StepBinding<M, H>
where
    M: Message,
    H: StepHandler<M>,
{
    async fn invoke(&self, ctx: &SagaContext, envelope: &MessageEnvelope) -> HandlerResult {
        self.handler.handle(ctx, envelope.decode()?).await
    }
}

struct ResponseBinding<R, H> {
    handler: H,
    _message: PhantomData<fn() -> R>,
}

#[async_trait]
impl<R, H> ErasedHandler for ResponseBinding<R, H>
where
    R: Response,
    H: ResponseHandler<R>,
{
    async fn invoke(&self, ctx: &SagaContext, envelope: &MessageEnvelope) -> HandlerResult {
        let response: R = envelope.decode()?;
        if response.is_success() {
            self.handler.handle_success_response(ctx, response).await
        } else {
            self.handler.handle_fail_response(ctx, response).await
        }
    }
}

struct CompensationBinding<M, H> {
    handler: H,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, H> ErasedHandler for CompensationBinding<M, H>
where
    M: Message,
    H: CompensationHandler<M>,
{
    async fn invoke(&self, ctx: &SagaContext, envelope: &MessageEnvelope) -> HandlerResult {
        self.handler.compensate(ctx, envelope.decode()?).await
    }
}

/// Immutable lookup table built once at startup.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Vec<HandlerBinding>>,
    compensations: HashMap<&'static str, Vec<HandlerBinding>>,
}

impl HandlerRegistry {
    /// Creates an empty registry builder.
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Start, step and response handlers for a message type, in registration order.
    pub fn handlers_for(&self, message_type: &str) -> &[HandlerBinding] {
        self.handlers
            .get(message_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Compensation handlers for a message type, in registration order.
    pub fn compensations_for(&self, message_type: &str) -> &[HandlerBinding] {
        self.compensations
            .get(message_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Message types with at least one non-compensation handler.
    pub fn message_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    /// Total number of registered handlers, compensations included.
    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum::<usize>()
            + self.compensations.values().map(Vec::len).sum::<usize>()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collects handler registrations.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    bindings: Vec<HandlerBinding>,
}

impl HandlerRegistryBuilder {
    /// Registers a handler allowed to begin a new saga on `M`.
    pub fn start<M, H>(self, handler_type: &'static str, handler: H) -> Self
    where
        M: Message,
        H: StartHandler<M> + 'static,
    {
        self.bind::<M>(
            handler_type,
            HandlerRole::Start,
            None,
            Arc::new(StartBinding {
                handler,
                _message: PhantomData,
            }),
        )
    }

    /// Registers a handler for `M` inside a running saga.
    pub fn step<M, H>(self, handler_type: &'static str, handler: H) -> Self
    where
        M: Message,
        H: StepHandler<M> + 'static,
    {
        self.bind::<M>(
            handler_type,
            HandlerRole::Step,
            None,
            Arc::new(StepBinding {
                handler,
                _message: PhantomData,
            }),
        )
    }

    /// Registers a handler for the response `R`, routed by its success flag.
    pub fn response<R, H>(self, handler_type: &'static str, handler: H) -> Self
    where
        R: Response,
        H: ResponseHandler<R> + 'static,
    {
        self.bind::<R>(
            handler_type,
            HandlerRole::Response,
            Some(<R::Request as Message>::MESSAGE_TYPE),
            Arc::new(ResponseBinding {
                handler,
                _message: PhantomData,
            }),
        )
    }

    /// Registers the handler that undoes completed `M` steps.
    pub fn compensation<M, H>(self, handler_type: &'static str, handler: H) -> Self
    where
        M: Message,
        H: CompensationHandler<M> + 'static,
    {
        self.bind::<M>(
            handler_type,
            HandlerRole::Compensation,
            None,
            Arc::new(CompensationBinding {
                handler,
                _message: PhantomData,
            }),
        )
    }

    fn bind<M: Message>(
        mut self,
        handler_type: &'static str,
        role: HandlerRole,
        request_type: Option<&'static str>,
        handler: Arc<dyn ErasedHandler>,
    ) -> Self {
        self.bindings.push(HandlerBinding {
            handler_type,
            role,
            message_type: M::MESSAGE_TYPE,
            message_kind: M::KIND,
            request_type,
            handler,
        });
        self
    }

    /// Builds the registry.
    ///
    /// Fails if the same handler name is registered twice for one message
    /// type and role, since both would write to the same step keys.
    pub fn build(self) -> Result<HandlerRegistry> {
        let mut registry = HandlerRegistry::default();
        for binding in self.bindings {
            let table = match binding.role {
                HandlerRole::Compensation => &mut registry.compensations,
                _ => &mut registry.handlers,
            };
            let entries = table.entry(binding.message_type).or_default();
            if entries
                .iter()
                .any(|b| b.handler_type == binding.handler_type && b.role == binding.role)
            {
                return Err(SagaError::HandlerResolution(format!(
                    "handler '{}' registered twice as {} handler for '{}'",
                    binding.handler_type, binding.role, binding.message_type
                )));
            }
            entries.push(binding);
        }
        Ok(registry)
    }
}
