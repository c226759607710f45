//! Saga inspection service entry point.

use api::AppState;
use api::config::{Config, LogFormat};
use opentelemetry_sdk::trace::TracerProvider;
use saga::CancellationSource;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Installs the W3C propagator and the tracer provider handler spans go to.
fn init_otel() -> TracerProvider {
    opentelemetry::global::set_text_map_propagator(saga::trace_context::propagator());
    let provider = TracerProvider::builder().build();
    opentelemetry::global::set_tracer_provider(provider.clone());
    provider
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    init_tracing(&config);
    let tracer_provider = init_otel();

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    let state = AppState::in_memory(config.saga.clone()).expect("invalid handler registry");

    let consumer = state.consumer();
    let stop_consumer = CancellationSource::new();
    let consumer_signal = stop_consumer.signal();
    let consumer_task = tokio::spawn(async move { consumer.run(consumer_signal).await });

    let app = api::create_app(state, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, application_id = %config.saga.application_id, "starting saga service");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    stop_consumer.cancel();
    match consumer_task.await {
        Ok(Ok(())) => tracing::info!("service shut down gracefully"),
        Ok(Err(e)) => tracing::error!(error = %e, "consumer stopped with an error"),
        Err(e) => tracing::error!(error = %e, "consumer task panicked"),
    }
    if let Err(e) = tracer_provider.shutdown() {
        tracing::warn!(error = %e, "tracer provider did not shut down cleanly");
    }
}
