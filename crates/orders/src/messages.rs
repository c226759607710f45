//! Messages exchanged by the order, inventory and payment participants.

use common::{Command, Event, Message, MessageKind, Response};
use serde::{Deserialize, Serialize};

use crate::values::{CustomerId, Money, OrderId, OrderItem};

macro_rules! message {
    ($name:ident, $kind:ident) => {
        impl Message for $name {
            const MESSAGE_TYPE: &'static str = stringify!($name);
            const KIND: MessageKind = MessageKind::$kind;
        }

        impl $kind for $name {}
    };
}

/// Places an order. Starts the order saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderCommand {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub items: Vec<OrderItem>,
}

/// The order was accepted and is waiting for stock and payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub items: Vec<OrderItem>,
    pub total: Money,
}

/// Asks the payment service to charge the customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPaymentCommand {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub amount: Money,
}

/// Outcome of a [`ProcessPaymentCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentResponse {
    pub order_id: OrderId,
    pub payment_id: Option<String>,
    pub declined_reason: Option<String>,
}

impl PaymentResponse {
    pub fn charged(order_id: OrderId, payment_id: impl Into<String>) -> Self {
        Self {
            order_id,
            payment_id: Some(payment_id.into()),
            declined_reason: None,
        }
    }

    pub fn declined(order_id: OrderId, reason: impl Into<String>) -> Self {
        Self {
            order_id,
            payment_id: None,
            declined_reason: Some(reason.into()),
        }
    }
}

/// The order is paid and confirmed. Ends the saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmedEvent {
    pub order_id: OrderId,
    pub payment_id: String,
}

message!(CreateOrderCommand, Command);
message!(OrderCreatedEvent, Event);
message!(ProcessPaymentCommand, Command);
message!(OrderConfirmedEvent, Event);

impl Message for PaymentResponse {
    const MESSAGE_TYPE: &'static str = "PaymentResponse";
    const KIND: MessageKind = MessageKind::Response;
}

impl Response for PaymentResponse {
    type Request = ProcessPaymentCommand;

    fn is_success(&self) -> bool {
        self.payment_id.is_some()
    }
}
