use std::time::Instant;

use async_trait::async_trait;

use super::{Invocation, Middleware, Next};
use crate::error::SagaError;
use crate::handler::HandlerResult;

/// Structured start/success/failure entries for each handler attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn invoke(&self, invocation: &Invocation<'_>, next: Next<'_>) -> HandlerResult {
        let ctx = invocation.context();
        let attempt = invocation.attempt();
        tracing::info!(
            saga_id = %ctx.saga_id(),
            message_id = %ctx.message_id(),
            correlation_id = %ctx.correlation_id(),
            message_type = %ctx.message().message_type,
            handler = ctx.handler_type(),
            role = %invocation.role(),
            attempt,
            "Handling message"
        );

        let start = Instant::now();
        let result = next.run(invocation).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => tracing::info!(
                saga_id = %ctx.saga_id(),
                message_id = %ctx.message_id(),
                handler = ctx.handler_type(),
                attempt,
                elapsed_ms,
                "Handler succeeded"
            ),
            Err(SagaError::Cancelled) => tracing::info!(
                saga_id = %ctx.saga_id(),
                message_id = %ctx.message_id(),
                handler = ctx.handler_type(),
                "Handler cancelled"
            ),
            Err(e) if e.is_transient() => tracing::warn!(
                saga_id = %ctx.saga_id(),
                message_id = %ctx.message_id(),
                handler = ctx.handler_type(),
                attempt,
                elapsed_ms,
                error = %e,
                "Handler failed with transient error"
            ),
            Err(e) => tracing::error!(
                saga_id = %ctx.saga_id(),
                message_id = %ctx.message_id(),
                handler = ctx.handler_type(),
                attempt,
                elapsed_ms,
                error = %e,
                error_type = e.kind_name(),
                "Handler failed"
            ),
        }

        result
    }
}
