//! Pulls deliveries from the bus and dispatches them concurrently.

use std::sync::Arc;

use common::MessageKind;
use futures_util::StreamExt;
use tokio::task::JoinSet;

use crate::bus::{Delivery, MessageBus};
use crate::cancellation::CancellationSignal;
use crate::dispatcher::SagaDispatcher;
use crate::error::{Result, SagaError};

/// Consumer loop binding a bus to a dispatcher.
///
/// Each delivery runs on its own task. Deliveries are acknowledged after
/// dispatch; unroutable messages are rejected without requeue and
/// transient failures are requeued. Events nobody subscribes to are
/// acknowledged and dropped, as a broker would never route them here.
#[derive(Clone)]
pub struct SagaConsumer {
    dispatcher: SagaDispatcher,
    bus: Arc<dyn MessageBus>,
}

impl SagaConsumer {
    pub fn new(dispatcher: SagaDispatcher, bus: Arc<dyn MessageBus>) -> Self {
        Self { dispatcher, bus }
    }

    /// Runs until `shutdown` fires or the stream ends, then waits for
    /// in-flight deliveries to finish.
    pub async fn run(&self, shutdown: CancellationSignal) -> Result<()> {
        let mut stream = self.bus.consume().await?;
        let mut in_flight = JoinSet::new();
        tracing::info!("Saga consumer started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, stopping consumer");
                    break;
                }
                next = stream.next() => match next {
                    Some(delivery) => {
                        let dispatcher = self.dispatcher.clone();
                        let cancellation = shutdown.clone();
                        in_flight.spawn(handle_delivery(dispatcher, delivery, cancellation));
                    }
                    None => {
                        tracing::info!("Message stream ended");
                        break;
                    }
                }
            }
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        tracing::info!("Saga consumer stopped");
        Ok(())
    }
}

async fn handle_delivery(
    dispatcher: SagaDispatcher,
    delivery: Delivery,
    cancellation: CancellationSignal,
) {
    let envelope = delivery.envelope.clone();
    if envelope.kind == MessageKind::Event
        && dispatcher
            .runtime()
            .registry()
            .handlers_for(&envelope.message_type)
            .is_empty()
    {
        tracing::debug!(
            message_id = %envelope.message_id,
            message_type = %envelope.message_type,
            "No subscribers for event, acknowledging"
        );
        delivery.ack();
        return;
    }

    let result = dispatcher
        .dispatch_with(envelope, delivery.handler_type.as_deref(), cancellation)
        .await;

    match result {
        Ok(report) => {
            tracing::debug!(
                saga_id = %report.saga_id,
                message_id = %report.message_id,
                handlers = report.handlers.len(),
                "Delivery handled"
            );
            delivery.ack();
        }
        Err(SagaError::Cancelled) => delivery.nack(true),
        Err(e) if e.is_transient() => {
            tracing::warn!(
                message_id = %delivery.envelope.message_id,
                error = %e,
                "Transient dispatch failure, requeueing"
            );
            delivery.nack(true);
        }
        Err(e) => {
            tracing::error!(
                message_id = %delivery.envelope.message_id,
                message_type = %delivery.envelope.message_type,
                error = %e,
                error_type = e.kind_name(),
                "Dispatch failed, dead-lettering"
            );
            delivery.nack(false);
        }
    }
}
