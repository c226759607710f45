//! Message bus port and an in-process loopback implementation.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use common::MessageEnvelope;
use futures_core::Stream;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by a message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport is temporarily unreachable.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    /// A consumer is already attached to this bus.
    #[error("A consumer is already attached")]
    ConsumerAttached,

    /// The bus has been shut down.
    #[error("Bus closed")]
    Closed,
}

impl BusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Unavailable(_))
    }
}

/// Stream of inbound deliveries.
pub type MessageStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// How a delivery was settled by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Ack,
    Nack { requeue: bool },
}

/// Transport-side settlement of one delivery.
pub trait Acknowledge: Send {
    fn settle(self: Box<Self>, envelope: &MessageEnvelope, outcome: DeliveryOutcome);
}

/// One inbound message plus its settlement handle.
pub struct Delivery {
    pub envelope: MessageEnvelope,
    /// Restricts dispatch to a single handler when the transport routes per handler queue.
    pub handler_type: Option<String>,
    acker: Option<Box<dyn Acknowledge>>,
}

impl Delivery {
    /// A delivery that needs no settlement.
    pub fn new(envelope: MessageEnvelope) -> Self {
        Self {
            envelope,
            handler_type: None,
            acker: None,
        }
    }

    pub fn with_acker(envelope: MessageEnvelope, acker: Box<dyn Acknowledge>) -> Self {
        Self {
            envelope,
            handler_type: None,
            acker: Some(acker),
        }
    }

    pub fn for_handler(mut self, handler_type: impl Into<String>) -> Self {
        self.handler_type = Some(handler_type.into());
        self
    }

    pub fn ack(self) {
        self.settle(DeliveryOutcome::Ack);
    }

    pub fn nack(self, requeue: bool) {
        self.settle(DeliveryOutcome::Nack { requeue });
    }

    fn settle(self, outcome: DeliveryOutcome) {
        if let Some(acker) = self.acker {
            acker.settle(&self.envelope, outcome);
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("handler_type", &self.handler_type)
            .finish_non_exhaustive()
    }
}

/// Transport port used by the saga engine.
///
/// `send` targets a single logical recipient (commands, responses),
/// `publish` fans out to every subscriber (events). The engine never
/// inspects how a transport routes; it only stamps envelopes.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn send(&self, envelope: MessageEnvelope) -> Result<(), BusError>;

    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), BusError>;

    /// Attaches the consumer and returns the inbound stream.
    async fn consume(&self) -> Result<MessageStream, BusError>;
}

const DEFAULT_MAX_REDELIVERIES: u32 = 3;
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

#[derive(Default)]
struct Recorded {
    sent: Vec<MessageEnvelope>,
    published: Vec<MessageEnvelope>,
    dead_letters: Vec<MessageEnvelope>,
    acked: usize,
}

struct InMemoryBusInner {
    recorded: Mutex<Recorded>,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    fail_on_send: AtomicBool,
    fail_on_publish: AtomicBool,
    max_redeliveries: u32,
}

impl InMemoryBusInner {
    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(self: &Arc<Self>, envelope: MessageEnvelope) {
        let acker = Box::new(InMemoryAcker {
            bus: Arc::clone(self),
        });
        // A closed receiver means nobody consumes; the envelope stays recorded.
        let _ = self.tx.send(Delivery::with_acker(envelope, acker));
    }
}

struct InMemoryAcker {
    bus: Arc<InMemoryBusInner>,
}

impl Acknowledge for InMemoryAcker {
    fn settle(self: Box<Self>, envelope: &MessageEnvelope, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Ack => self.bus.recorded().acked += 1,
            DeliveryOutcome::Nack { requeue: true } => {
                let count: u32 = envelope
                    .header(DELIVERY_COUNT_HEADER)
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0);
                if count >= self.bus.max_redeliveries {
                    tracing::warn!(
                        message_id = %envelope.message_id,
                        count,
                        "redelivery limit reached, dead-lettering"
                    );
                    self.bus.recorded().dead_letters.push(envelope.clone());
                } else {
                    let mut redelivered = envelope.clone();
                    redelivered
                        .headers
                        .insert(DELIVERY_COUNT_HEADER.to_string(), (count + 1).to_string());
                    self.bus.enqueue(redelivered);
                }
            }
            DeliveryOutcome::Nack { requeue: false } => {
                self.bus.recorded().dead_letters.push(envelope.clone());
            }
        }
    }
}

/// In-process bus that records every envelope and loops it back to the consumer.
///
/// Useful for tests and for running every service of a saga in one process.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<InMemoryBusInner>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(InMemoryBusInner {
                recorded: Mutex::new(Recorded::default()),
                tx,
                rx: Mutex::new(Some(rx)),
                fail_on_send: AtomicBool::new(false),
                fail_on_publish: AtomicBool::new(false),
                max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            }),
        }
    }

    /// Injects an inbound message, as if it arrived from another service.
    pub fn deliver(&self, envelope: MessageEnvelope) {
        self.inner.enqueue(envelope);
    }

    /// Makes `send` fail with a transient error while set.
    pub fn set_fail_on_send(&self, fail: bool) {
        self.inner.fail_on_send.store(fail, Ordering::SeqCst);
    }

    /// Makes `publish` fail with a transient error while set.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.inner.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<MessageEnvelope> {
        self.inner.recorded().sent.clone()
    }

    pub fn published(&self) -> Vec<MessageEnvelope> {
        self.inner.recorded().published.clone()
    }

    pub fn dead_letters(&self) -> Vec<MessageEnvelope> {
        self.inner.recorded().dead_letters.clone()
    }

    pub fn acked_count(&self) -> usize {
        self.inner.recorded().acked
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn send(&self, envelope: MessageEnvelope) -> Result<(), BusError> {
        if self.inner.fail_on_send.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("send failed (simulated)".to_string()));
        }
        tracing::debug!(message_type = %envelope.message_type, message_id = %envelope.message_id, "send");
        self.inner.recorded().sent.push(envelope.clone());
        self.inner.enqueue(envelope);
        Ok(())
    }

    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), BusError> {
        if self.inner.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable(
                "publish failed (simulated)".to_string(),
            ));
        }
        tracing::debug!(message_type = %envelope.message_type, message_id = %envelope.message_id, "publish");
        self.inner.recorded().published.push(envelope.clone());
        self.inner.enqueue(envelope);
        Ok(())
    }

    async fn consume(&self) -> Result<MessageStream, BusError> {
        let rx = self
            .inner
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BusError::ConsumerAttached)?;

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(Box::pin(stream))
    }
}
