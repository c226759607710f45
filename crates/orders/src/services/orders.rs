//! Order book owned by the order service.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{OrderError, Result};
use crate::values::{CustomerId, Money, OrderId, OrderItem};

/// Lifecycle of an order.
///
/// ```text
/// Pending ──► Confirmed
///    │
///    └──────► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Confirmed,
    Cancelled,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "Pending",
            OrderState::Confirmed => "Confirmed",
            OrderState::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub items: Vec<OrderItem>,
    pub total: Money,
    pub state: OrderState,
    pub payment_id: Option<String>,
}

#[async_trait]
pub trait OrderService: Send + Sync {
    /// Records a pending order. Returns false if the order already exists.
    async fn create(&self, order: Order) -> Result<bool>;

    async fn confirm(&self, order_id: OrderId, payment_id: &str) -> Result<()>;

    /// Cancels the order. Cancelling an already cancelled order is a no-op.
    async fn cancel(&self, order_id: OrderId) -> Result<()>;

    async fn get(&self, order_id: OrderId) -> Option<Order>;
}

#[derive(Debug, Default)]
struct InMemoryOrderState {
    orders: HashMap<OrderId, Order>,
    fail_on_create: bool,
}

/// In-memory order book.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderService {
    state: Arc<RwLock<InMemoryOrderState>>,
}

impl InMemoryOrderService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `create` fail with a transient error while set.
    pub async fn set_fail_on_create(&self, fail: bool) {
        self.state.write().await.fail_on_create = fail;
    }

    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }
}

#[async_trait]
impl OrderService for InMemoryOrderService {
    async fn create(&self, order: Order) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.fail_on_create {
            return Err(OrderError::Unavailable("order book unavailable".to_string()));
        }
        if state.orders.contains_key(&order.order_id) {
            return Ok(false);
        }
        state.orders.insert(order.order_id, order);
        Ok(true)
    }

    async fn confirm(&self, order_id: OrderId, payment_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or(OrderError::OrderNotFound(order_id))?;
        match order.state {
            OrderState::Pending => {
                order.state = OrderState::Confirmed;
                order.payment_id = Some(payment_id.to_string());
                Ok(())
            }
            OrderState::Confirmed if order.payment_id.as_deref() == Some(payment_id) => Ok(()),
            from => Err(OrderError::InvalidState {
                order_id,
                from,
                to: OrderState::Confirmed,
            }),
        }
    }

    async fn cancel(&self, order_id: OrderId) -> Result<()> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or(OrderError::OrderNotFound(order_id))?;
        match order.state {
            OrderState::Pending | OrderState::Cancelled => {
                order.state = OrderState::Cancelled;
                Ok(())
            }
            from => Err(OrderError::InvalidState {
                order_id,
                from,
                to: OrderState::Cancelled,
            }),
        }
    }

    async fn get(&self, order_id: OrderId) -> Option<Order> {
        self.state.read().await.orders.get(&order_id).cloned()
    }
}
