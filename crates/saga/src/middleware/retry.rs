use async_trait::async_trait;

use super::{Invocation, Middleware, Next, ensure_not_cancelled};
use crate::handler::HandlerResult;
use crate::retry::{RetryEvent, RetryPolicy};

/// Retries transient handler failures with bounded, jittered exponential backoff.
///
/// Fatal errors propagate immediately. Each retry is reported to an
/// observer built for this invocation, which logs the attempt and counts
/// it; inner middleware see the current attempt through
/// [`Invocation::attempt`].
#[derive(Debug, Clone, Default)]
pub struct RetryMiddleware {
    policy: RetryPolicy,
}

impl RetryMiddleware {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn invoke(&self, invocation: &Invocation<'_>, next: Next<'_>) -> HandlerResult {
        let ctx = invocation.context();
        let observer = |event: &RetryEvent<'_>| {
            tracing::warn!(
                saga_id = %ctx.saga_id(),
                message_id = %ctx.message_id(),
                handler = ctx.handler_type(),
                attempt = event.attempt,
                max_attempts = event.max_attempts,
                delay_ms = event.delay.as_millis() as u64,
                error = %event.error,
                "Transient handler failure, retrying"
            );
            metrics::counter!("saga_retry_attempts_total", "handler" => ctx.handler_type().to_string())
                .increment(1);
        };

        self.policy
            .execute(
                move |attempt| async move {
                    if attempt > 1 {
                        ensure_not_cancelled(invocation)?;
                    }
                    invocation.set_attempt(attempt);
                    next.run(invocation).await
                },
                &observer,
            )
            .await
    }
}
