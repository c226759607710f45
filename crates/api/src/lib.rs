//! Saga inspection service.
//!
//! Runs the sample order saga on the in-memory bus and store and exposes
//! its audit trail over HTTP, with structured logging (tracing) and
//! Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use orders::OrderServices;
use saga::{
    InMemoryBus, InMemorySagaStore, MessageBus, SagaConfig, SagaConsumer, SagaDispatcher,
    SagaRuntime,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state of every route.
pub struct AppState {
    pub runtime: Arc<SagaRuntime>,
    pub bus: InMemoryBus,
    pub services: OrderServices,
}

impl AppState {
    /// Wires the order saga onto a fresh in-memory store and bus.
    pub fn in_memory(config: SagaConfig) -> saga::Result<Arc<Self>> {
        let services = OrderServices::new();
        let bus = InMemoryBus::new();
        let runtime = SagaRuntime::builder(
            Arc::new(InMemorySagaStore::new()),
            Arc::new(bus.clone()),
        )
        .registry(services.registry()?)
        .config(config)
        .build();

        Ok(Arc::new(Self {
            runtime,
            bus,
            services,
        }))
    }

    /// Consumer loop feeding the bus into the saga dispatcher.
    pub fn consumer(&self) -> SagaConsumer {
        let bus: Arc<dyn MessageBus> = Arc::new(self.bus.clone());
        SagaConsumer::new(SagaDispatcher::new(Arc::clone(&self.runtime)), bus)
    }
}

/// Creates the router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::place))
        .route("/orders/{id}", get(routes::orders::get))
        .route("/sagas/{id}", get(routes::sagas::get))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
