//! Stock reservations held by the inventory service.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{OrderError, Result};
use crate::values::{OrderId, OrderItem};

#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves stock for the order and returns the reservation id.
    /// Reserving again for the same order returns the existing reservation.
    async fn reserve(&self, order_id: OrderId, items: &[OrderItem]) -> Result<String>;

    /// Releases the order's reservation, if any. Returns true if one was released.
    async fn release(&self, order_id: OrderId) -> Result<bool>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    reservations: HashMap<OrderId, (String, Vec<OrderItem>)>,
    next_id: u32,
    fail_on_reserve: bool,
}

/// In-memory inventory service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every reservation fail for lack of stock while set.
    pub async fn set_fail_on_reserve(&self, fail: bool) {
        self.state.write().await.fail_on_reserve = fail;
    }

    pub async fn reservation_count(&self) -> usize {
        self.state.read().await.reservations.len()
    }

    pub async fn reservation_for(&self, order_id: OrderId) -> Option<String> {
        self.state
            .read()
            .await
            .reservations
            .get(&order_id)
            .map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(&self, order_id: OrderId, items: &[OrderItem]) -> Result<String> {
        let mut state = self.state.write().await;
        if state.fail_on_reserve {
            let products: Vec<&str> = items.iter().map(|i| i.product_id.as_str()).collect();
            return Err(OrderError::InsufficientStock(products.join(", ")));
        }
        if let Some((reservation_id, _)) = state.reservations.get(&order_id) {
            return Ok(reservation_id.clone());
        }

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state
            .reservations
            .insert(order_id, (reservation_id.clone(), items.to_vec()));
        Ok(reservation_id)
    }

    async fn release(&self, order_id: OrderId) -> Result<bool> {
        Ok(self
            .state
            .write()
            .await
            .reservations
            .remove(&order_id)
            .is_some())
    }
}
