//! Saga handlers of the order, inventory and payment participants.
//!
//! The happy path:
//! ```text
//! CreateOrderCommand ─► OrderCreatedEvent ─► ProcessPaymentCommand ─► PaymentResponse ─► OrderConfirmedEvent
//!   (order service)      (inventory)           (payment)               (order service)
//! ```
//! Every step that has an effect to undo registers a compensation handler
//! for the message that drove it.

use std::sync::Arc;

use async_trait::async_trait;
use saga::{
    CompensationHandler, HandlerResult, ResponseHandler, SagaContext, SagaData, StartHandler,
    StepHandler,
};
use serde::{Deserialize, Serialize};

use crate::error::OrderError;
use crate::messages::{
    CreateOrderCommand, OrderConfirmedEvent, OrderCreatedEvent, PaymentResponse,
    ProcessPaymentCommand,
};
use crate::services::{InventoryService, Order, OrderService, OrderState, PaymentService};
use crate::values::{OrderId, order_total};

pub const CREATE_ORDER: &str = "OrderService.CreateOrder";
pub const CANCEL_ORDER: &str = "OrderService.CancelOrder";
pub const CONFIRM_ORDER: &str = "OrderService.ConfirmOrder";
pub const RESERVE_STOCK: &str = "InventoryService.ReserveStock";
pub const RELEASE_STOCK: &str = "InventoryService.ReleaseStock";
pub const PROCESS_PAYMENT: &str = "PaymentService.ProcessPayment";
pub const REFUND_PAYMENT: &str = "PaymentService.RefundPayment";

/// Saga data of one order saga.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSagaData {
    pub order_id: Option<OrderId>,
    pub reservation_id: Option<String>,
    pub payment_id: Option<String>,
}

async fn update_order_data(
    ctx: &SagaContext,
    update: impl FnOnce(&mut OrderSagaData) + Send,
) -> saga::Result<()> {
    let mut data = ctx
        .load_saga_data::<OrderSagaData>()
        .await?
        .unwrap_or_else(|| SagaData::new(ctx.saga_id(), OrderSagaData::default()));
    update(&mut data.data);
    ctx.save_saga_data(&data).await
}

pub struct CreateOrderHandler {
    pub orders: Arc<dyn OrderService>,
}

#[async_trait]
impl StartHandler<CreateOrderCommand> for CreateOrderHandler {
    async fn handle_start(&self, ctx: &SagaContext, command: CreateOrderCommand) -> HandlerResult {
        let total = order_total(&command.items);
        let created = self
            .orders
            .create(Order {
                order_id: command.order_id,
                customer_id: command.customer_id,
                items: command.items.clone(),
                total,
                state: OrderState::Pending,
                payment_id: None,
            })
            .await?;
        if created {
            metrics::counter!("orders_created_total").increment(1);
        }
        tracing::info!(order_id = %command.order_id, %total, created, "Order accepted");

        update_order_data(ctx, |data| data.order_id = Some(command.order_id)).await?;
        ctx.publish_with_tracking(OrderCreatedEvent {
            order_id: command.order_id,
            customer_id: command.customer_id,
            items: command.items,
            total,
        })
        .then_mark_as_complete::<CreateOrderCommand>()
        .await?;
        Ok(())
    }
}

pub struct CancelOrderHandler {
    pub orders: Arc<dyn OrderService>,
}

#[async_trait]
impl CompensationHandler<CreateOrderCommand> for CancelOrderHandler {
    async fn compensate(&self, _ctx: &SagaContext, command: CreateOrderCommand) -> HandlerResult {
        self.orders.cancel(command.order_id).await?;
        metrics::counter!("orders_cancelled_total").increment(1);
        tracing::info!(order_id = %command.order_id, "Order cancelled");
        Ok(())
    }
}

pub struct ReserveStockHandler {
    pub inventory: Arc<dyn InventoryService>,
}

#[async_trait]
impl StepHandler<OrderCreatedEvent> for ReserveStockHandler {
    async fn handle(&self, ctx: &SagaContext, event: OrderCreatedEvent) -> HandlerResult {
        let reservation_id = self.inventory.reserve(event.order_id, &event.items).await?;
        tracing::info!(order_id = %event.order_id, %reservation_id, "Stock reserved");

        update_order_data(ctx, |data| data.reservation_id = Some(reservation_id)).await?;
        ctx.send_with_tracking(ProcessPaymentCommand {
            order_id: event.order_id,
            customer_id: event.customer_id,
            amount: event.total,
        })
        .then_mark_as_complete::<OrderCreatedEvent>()
        .await?;
        Ok(())
    }
}

pub struct ReleaseStockHandler {
    pub inventory: Arc<dyn InventoryService>,
}

#[async_trait]
impl CompensationHandler<OrderCreatedEvent> for ReleaseStockHandler {
    async fn compensate(&self, _ctx: &SagaContext, event: OrderCreatedEvent) -> HandlerResult {
        let released = self.inventory.release(event.order_id).await?;
        tracing::info!(order_id = %event.order_id, released, "Stock released");
        Ok(())
    }
}

pub struct ProcessPaymentHandler {
    pub payments: Arc<dyn PaymentService>,
}

#[async_trait]
impl StepHandler<ProcessPaymentCommand> for ProcessPaymentHandler {
    async fn handle(&self, ctx: &SagaContext, command: ProcessPaymentCommand) -> HandlerResult {
        if ctx.is_already_completed::<ProcessPaymentCommand>().await? {
            return Ok(());
        }

        let response = match self
            .payments
            .charge(command.order_id, command.customer_id, command.amount)
            .await
        {
            Ok(payment_id) => PaymentResponse::charged(command.order_id, payment_id),
            Err(OrderError::PaymentDeclined(reason)) => {
                tracing::warn!(order_id = %command.order_id, %reason, "Payment declined");
                PaymentResponse::declined(command.order_id, reason)
            }
            Err(e) => return Err(e.into()),
        };

        ctx.respond(response).await?;
        ctx.mark_as_complete::<ProcessPaymentCommand>().await?;
        Ok(())
    }
}

pub struct RefundPaymentHandler {
    pub payments: Arc<dyn PaymentService>,
}

#[async_trait]
impl CompensationHandler<ProcessPaymentCommand> for RefundPaymentHandler {
    async fn compensate(&self, _ctx: &SagaContext, command: ProcessPaymentCommand) -> HandlerResult {
        let refunded = self.payments.refund(command.order_id).await?;
        tracing::info!(order_id = %command.order_id, refunded, "Payment refunded");
        Ok(())
    }
}

/// Confirms the order once paid. A declined payment fails the step, which
/// rolls back the order, the stock reservation and the payment step.
pub struct ConfirmOrderHandler {
    pub orders: Arc<dyn OrderService>,
}

#[async_trait]
impl ResponseHandler<PaymentResponse> for ConfirmOrderHandler {
    async fn handle_success_response(
        &self,
        ctx: &SagaContext,
        response: PaymentResponse,
    ) -> HandlerResult {
        let payment_id = response.payment_id.unwrap_or_default();
        self.orders.confirm(response.order_id, &payment_id).await?;

        update_order_data(ctx, |data| data.payment_id = Some(payment_id.clone())).await?;
        ctx.complete_saga().await?;
        ctx.publish_with_tracking(OrderConfirmedEvent {
            order_id: response.order_id,
            payment_id,
        })
        .then_mark_as_complete::<PaymentResponse>()
        .await?;
        metrics::counter!("orders_confirmed_total").increment(1);
        Ok(())
    }

    async fn handle_fail_response(
        &self,
        _ctx: &SagaContext,
        response: PaymentResponse,
    ) -> HandlerResult {
        let reason = response
            .declined_reason
            .unwrap_or_else(|| "no reason given".to_string());
        Err(OrderError::PaymentDeclined(reason).into())
    }
}
