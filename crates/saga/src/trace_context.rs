//! W3C trace context propagation over message headers.
//!
//! Context is injected into and extracted from the envelope header map
//! through the OpenTelemetry `TraceContextPropagator`; nothing is read
//! from ambient task-local state.

use common::Headers;
use opentelemetry::Context;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};

/// W3C trace context propagator for message headers.
pub fn propagator() -> impl TextMapPropagator {
    TraceContextPropagator::new()
}

/// Write side of the header map for the propagator.
struct HeaderInjector<'a>(&'a mut Headers);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

/// Read side of the header map. Header names match case-insensitively.
struct HeaderExtractor<'a>(&'a Headers);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// The span of one handler invocation and the remote span that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceContext {
    span: SpanContext,
    parent: Option<SpanContext>,
}

impl TraceContext {
    /// Starts a new sampled trace.
    pub fn new_root() -> Self {
        let ids = RandomIdGenerator::default();
        Self {
            span: SpanContext::new(
                ids.new_trace_id(),
                ids.new_span_id(),
                TraceFlags::SAMPLED,
                false,
                TraceState::default(),
            ),
            parent: None,
        }
    }

    /// A new span in the same trace, parented to `parent`.
    pub fn child_of(parent: SpanContext) -> Self {
        Self {
            span: SpanContext::new(
                parent.trace_id(),
                RandomIdGenerator::default().new_span_id(),
                parent.trace_flags(),
                false,
                parent.trace_state().clone(),
            ),
            parent: Some(parent),
        }
    }

    pub fn span_context(&self) -> &SpanContext {
        &self.span
    }

    pub fn trace_id(&self) -> TraceId {
        self.span.trace_id()
    }

    pub fn span_id(&self) -> SpanId {
        self.span.span_id()
    }

    /// Span id of the upstream span, `None` for a root.
    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent.as_ref().map(SpanContext::span_id)
    }

    pub fn is_sampled(&self) -> bool {
        self.span.is_sampled()
    }

    /// OpenTelemetry context holding the upstream span, empty for a root.
    pub fn parent_context(&self) -> Context {
        match &self.parent {
            Some(parent) => Context::new().with_remote_span_context(parent.clone()),
            None => Context::new(),
        }
    }

    /// OpenTelemetry context holding this span.
    pub fn to_context(&self) -> Context {
        Context::new().with_remote_span_context(self.span.clone())
    }
}

/// Writes `traceparent` and `tracestate` for `context` into the headers.
pub fn inject(context: &TraceContext, headers: &mut Headers) {
    propagator().inject_context(&context.to_context(), &mut HeaderInjector(headers));
}

/// Reads the remote span carried by the headers, if any.
pub fn extract(headers: &Headers) -> Option<SpanContext> {
    let context = propagator().extract(&HeaderExtractor(headers));
    let span = context.span().span_context().clone();
    span.is_valid().then_some(span)
}

/// The context for handling a message: a child of the inbound trace, or a new root.
pub fn continue_from(headers: &Headers) -> TraceContext {
    match extract(headers) {
        Some(parent) => TraceContext::child_of(parent),
        None => TraceContext::new_root(),
    }
}
