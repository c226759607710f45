//! Composable pipeline wrapped around every handler invocation.
//!
//! Middleware run in registration order, outermost first. Each receives
//! the invocation and a [`Next`] continuation; `Next` is `Copy`, so a
//! middleware may call it more than once (retry) or not at all.

mod logging;
mod retry;
mod telemetry;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::context::SagaContext;
use crate::error::SagaError;
use crate::handler::{HandlerResult, HandlerRole};
use crate::retry::RetryPolicy;

pub use logging::LoggingMiddleware;
pub use retry::RetryMiddleware;
pub use telemetry::TelemetryMiddleware;

/// One handler invocation flowing through the pipeline.
#[derive(Debug)]
pub struct Invocation<'a> {
    context: &'a SagaContext,
    role: HandlerRole,
    attempt: AtomicU32,
}

impl<'a> Invocation<'a> {
    pub fn new(context: &'a SagaContext, role: HandlerRole) -> Self {
        Self {
            context,
            role,
            attempt: AtomicU32::new(1),
        }
    }

    pub fn context(&self) -> &'a SagaContext {
        self.context
    }

    pub fn role(&self) -> HandlerRole {
        self.role
    }

    /// Current attempt, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::Relaxed)
    }

    pub(crate) fn set_attempt(&self, attempt: u32) {
        self.attempt.store(attempt, Ordering::Relaxed);
    }
}

/// The innermost call: the handler itself.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, invocation: &Invocation<'_>) -> HandlerResult;
}

/// A cross-cutting wrapper around handler invocations.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn invoke(&self, invocation: &Invocation<'_>, next: Next<'_>) -> HandlerResult;
}

/// The remainder of the pipeline.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub async fn run(self, invocation: &Invocation<'_>) -> HandlerResult {
        match self.middlewares.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    middlewares: rest,
                    endpoint: self.endpoint,
                };
                head.invoke(invocation, next).await
            }
            None => self.endpoint.call(invocation).await,
        }
    }
}

/// Ordered middleware list.
#[derive(Clone, Default)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    /// An empty pipeline: handlers are called directly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry, then logging, then tracing.
    pub fn standard(retry: RetryPolicy) -> Self {
        Self::new()
            .with(RetryMiddleware::new(retry))
            .with(LoggingMiddleware)
            .with(TelemetryMiddleware)
    }

    /// Appends a middleware inside the ones already registered.
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    pub async fn run(&self, invocation: &Invocation<'_>, endpoint: &dyn Endpoint) -> HandlerResult {
        Next {
            middlewares: &self.middlewares,
            endpoint,
        }
        .run(invocation)
        .await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Returns `Err(SagaError::Cancelled)` once the invocation's context is cancelled.
pub(crate) fn ensure_not_cancelled(invocation: &Invocation<'_>) -> HandlerResult {
    if invocation.context().cancellation().is_cancelled() {
        Err(SagaError::Cancelled)
    } else {
        Ok(())
    }
}
