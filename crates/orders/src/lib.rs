//! Sample order saga.
//!
//! Three participants cooperate over the bus: the order service accepts
//! and confirms orders, the inventory service reserves stock and the
//! payment service charges the customer. Each participant undoes its own
//! work through a compensation handler when a later step fails.

pub mod error;
pub mod handlers;
pub mod messages;
pub mod services;
pub mod values;

use std::sync::Arc;

use common::MessageEnvelope;
use saga::HandlerRegistry;

pub use error::{OrderError, Result};
pub use handlers::OrderSagaData;
pub use messages::{
    CreateOrderCommand, OrderConfirmedEvent, OrderCreatedEvent, PaymentResponse,
    ProcessPaymentCommand,
};
pub use services::{
    InMemoryInventoryService, InMemoryOrderService, InMemoryPaymentService, Order, OrderState,
};
pub use values::{CustomerId, Money, OrderId, OrderItem};

/// The in-memory domain services behind every participant.
#[derive(Debug, Clone, Default)]
pub struct OrderServices {
    pub orders: InMemoryOrderService,
    pub inventory: InMemoryInventoryService,
    pub payments: InMemoryPaymentService,
}

impl OrderServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every handler of the order saga.
    pub fn registry(&self) -> saga::Result<HandlerRegistry> {
        use handlers::*;

        let orders: Arc<dyn services::OrderService> = Arc::new(self.orders.clone());
        let inventory: Arc<dyn services::InventoryService> = Arc::new(self.inventory.clone());
        let payments: Arc<dyn services::PaymentService> = Arc::new(self.payments.clone());

        HandlerRegistry::builder()
            .start::<CreateOrderCommand, _>(
                CREATE_ORDER,
                CreateOrderHandler {
                    orders: orders.clone(),
                },
            )
            .compensation::<CreateOrderCommand, _>(
                CANCEL_ORDER,
                CancelOrderHandler {
                    orders: orders.clone(),
                },
            )
            .step::<OrderCreatedEvent, _>(
                RESERVE_STOCK,
                ReserveStockHandler {
                    inventory: inventory.clone(),
                },
            )
            .compensation::<OrderCreatedEvent, _>(RELEASE_STOCK, ReleaseStockHandler { inventory })
            .step::<ProcessPaymentCommand, _>(
                PROCESS_PAYMENT,
                ProcessPaymentHandler {
                    payments: payments.clone(),
                },
            )
            .compensation::<ProcessPaymentCommand, _>(
                REFUND_PAYMENT,
                RefundPaymentHandler { payments },
            )
            .response::<PaymentResponse, _>(CONFIRM_ORDER, ConfirmOrderHandler { orders })
            .build()
    }
}

/// Wraps a new order as the root message of an order saga.
pub fn place_order(
    command: &CreateOrderCommand,
    application_id: &str,
) -> std::result::Result<MessageEnvelope, serde_json::Error> {
    MessageEnvelope::root(command, application_id)
}
