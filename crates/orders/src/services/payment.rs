//! Charges and refunds handled by the payment service.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{OrderError, Result};
use crate::values::{CustomerId, Money, OrderId};

#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges the customer for the order and returns the payment id.
    /// Charging an already charged order returns the existing payment.
    async fn charge(
        &self,
        order_id: OrderId,
        customer_id: CustomerId,
        amount: Money,
    ) -> Result<String>;

    /// Refunds the order's payment, if any. Returns true if one was refunded.
    async fn refund(&self, order_id: OrderId) -> Result<bool>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<OrderId, (String, CustomerId, Money)>,
    refunded: Vec<String>,
    next_id: u32,
    fail_on_charge: bool,
}

/// In-memory payment service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every charge get declined while set.
    pub async fn set_fail_on_charge(&self, fail: bool) {
        self.state.write().await.fail_on_charge = fail;
    }

    pub async fn payment_count(&self) -> usize {
        self.state.read().await.payments.len()
    }

    /// Payment ids refunded so far, oldest first.
    pub async fn refunded(&self) -> Vec<String> {
        self.state.read().await.refunded.clone()
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(
        &self,
        order_id: OrderId,
        customer_id: CustomerId,
        amount: Money,
    ) -> Result<String> {
        let mut state = self.state.write().await;
        if state.fail_on_charge {
            return Err(OrderError::PaymentDeclined(format!(
                "card declined for {amount}"
            )));
        }
        if let Some((payment_id, _, _)) = state.payments.get(&order_id) {
            return Ok(payment_id.clone());
        }

        state.next_id += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state
            .payments
            .insert(order_id, (payment_id.clone(), customer_id, amount));
        Ok(payment_id)
    }

    async fn refund(&self, order_id: OrderId) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.payments.remove(&order_id) {
            Some((payment_id, _, _)) => {
                state.refunded.push(payment_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
