//! Entry point into the sample order saga.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{MessageId, SagaId};
use orders::services::OrderService;
use orders::{CreateOrderCommand, CustomerId, Money, Order, OrderId, OrderItem, place_order};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct PlaceOrderRequest {
    pub customer_id: Option<String>,
    pub items: Vec<OrderItemRequest>,
}

#[derive(Deserialize)]
pub struct OrderItemRequest {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

#[derive(Serialize)]
pub struct OrderPlacedResponse {
    pub order_id: OrderId,
    pub saga_id: SagaId,
    pub message_id: MessageId,
}

#[derive(Serialize)]
pub struct OrderResponse {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub state: String,
    pub total_cents: i64,
    pub payment_id: Option<String>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            order_id: order.order_id,
            customer_id: order.customer_id,
            state: order.state.to_string(),
            total_cents: order.total.cents(),
            payment_id: order.payment_id,
        }
    }
}

fn validate(req: PlaceOrderRequest) -> Result<CreateOrderCommand, ApiError> {
    let customer_id = match req.customer_id.as_deref() {
        Some(raw) => CustomerId::parse(raw)
            .map_err(|e| ApiError::BadRequest(format!("Invalid customer_id: {e}")))?,
        None => CustomerId::new(),
    };
    if req.items.is_empty() {
        return Err(ApiError::BadRequest(
            "An order needs at least one item".to_string(),
        ));
    }

    let mut items = Vec::with_capacity(req.items.len());
    for item in req.items {
        if item.quantity == 0 {
            return Err(ApiError::BadRequest(format!(
                "Quantity of {} must be positive",
                item.product_id
            )));
        }
        let unit_price = Money::from_cents(item.unit_price_cents);
        if !unit_price.is_positive() {
            return Err(ApiError::BadRequest(format!(
                "Price of {} must be positive",
                item.product_id
            )));
        }
        items.push(OrderItem::new(item.product_id.as_str(), item.quantity, unit_price));
    }

    Ok(CreateOrderCommand {
        order_id: OrderId::new(),
        customer_id,
        items,
    })
}

/// POST /orders: starts an order saga and returns its id right away.
#[tracing::instrument(skip(state, req))]
pub async fn place(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<(StatusCode, Json<OrderPlacedResponse>), ApiError> {
    let command = validate(req)?;

    let mut envelope = place_order(&command, &state.runtime.config().application_id)
        .map_err(|e| ApiError::Internal(format!("Failed to encode order: {e}")))?;
    let saga_id = SagaId::new();
    envelope.saga_id = Some(saga_id);
    let message_id = envelope.message_id;

    state.bus.deliver(envelope);
    metrics::counter!("orders_placed_total").increment(1);
    tracing::info!(order_id = %command.order_id, %saga_id, "Order placed");

    Ok((
        StatusCode::ACCEPTED,
        Json(OrderPlacedResponse {
            order_id: command.order_id,
            saga_id,
            message_id,
        }),
    ))
}

/// GET /orders/{id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = OrderId::parse(&id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid order id '{id}': {e}")))?;
    let order = state
        .services
        .orders
        .get(order_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Order {order_id} not found")))?;
    Ok(Json(order.into()))
}
