use std::time::Instant;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::{Span, SpanKind, Status, Tracer};
use tracing::Instrument;

use super::{Invocation, Middleware, Next};
use crate::handler::HandlerResult;

const TRACER_NAME: &str = "saga";

/// Opens a span per invocation, parented to the trace carried by the
/// inbound message headers.
///
/// The OpenTelemetry span reuses the ids of the context's trace, so the
/// `traceparent` stamped on outgoing messages points at it. Spans go to
/// the globally installed tracer provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryMiddleware;

/// Span status for a handler result.
fn span_status(result: &HandlerResult) -> Status {
    match result {
        Ok(()) => Status::Ok,
        Err(e) => Status::error(e.to_string()),
    }
}

#[async_trait]
impl Middleware for TelemetryMiddleware {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    async fn invoke(&self, invocation: &Invocation<'_>, next: Next<'_>) -> HandlerResult {
        let ctx = invocation.context();
        let trace = ctx.trace_context();

        let tracer = global::tracer(TRACER_NAME);
        let mut otel_span = tracer
            .span_builder(format!("{} {}", ctx.handler_type(), ctx.message().message_type))
            .with_kind(SpanKind::Consumer)
            .with_trace_id(trace.trace_id())
            .with_span_id(trace.span_id())
            .with_attributes([
                KeyValue::new("saga.id", ctx.saga_id().to_string()),
                KeyValue::new("saga.handler", ctx.handler_type().to_string()),
                KeyValue::new("messaging.message.id", ctx.message_id().to_string()),
                KeyValue::new("messaging.message.type", ctx.message().message_type.clone()),
                KeyValue::new("saga.role", invocation.role().to_string()),
            ])
            .start_with_context(&tracer, &trace.parent_context());

        let span = tracing::info_span!(
            "saga.handle",
            saga_id = %ctx.saga_id(),
            message_id = %ctx.message_id(),
            correlation_id = %ctx.correlation_id(),
            message_type = %ctx.message().message_type,
            handler = ctx.handler_type(),
            application_id = ctx.application_id(),
            role = %invocation.role(),
            trace_id = %trace.trace_id(),
            span_id = %trace.span_id(),
            parent_span_id = tracing::field::Empty,
            otel.status_code = tracing::field::Empty,
        );
        if let Some(parent) = trace.parent_span_id() {
            span.record("parent_span_id", tracing::field::display(parent));
        }

        let start = Instant::now();
        let result = next.run(invocation).instrument(span.clone()).await;

        let status = span_status(&result);
        span.record(
            "otel.status_code",
            if status == Status::Ok { "OK" } else { "ERROR" },
        );
        otel_span.set_status(status);
        otel_span.end();

        metrics::histogram!(
            "saga_handler_duration_seconds",
            "handler" => ctx.handler_type().to_string(),
            "outcome" => if result.is_ok() { "success" } else { "failure" }
        )
        .record(start.elapsed().as_secs_f64());

        result
    }
}
