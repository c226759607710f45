//! Errors raised by the order saga participants.

use saga::SagaError;
use thiserror::Error;

use crate::services::OrderState;
use crate::values::OrderId;

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("Order {order_id} cannot move from {from} to {to}")]
    InvalidState {
        order_id: OrderId,
        from: OrderState,
        to: OrderState,
    },

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Payment declined: {0}")]
    PaymentDeclined(String),

    /// A downstream service could not be reached; retrying may succeed.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl From<OrderError> for SagaError {
    fn from(error: OrderError) -> Self {
        match error {
            OrderError::Unavailable(reason) => SagaError::transient(reason),
            other => SagaError::handler(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrderError>;
