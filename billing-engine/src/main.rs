//! Billing engine entry point.
//!
//! Runs the charge dispatcher and periodic reconciliation over the
//! in-process stores until a shutdown signal arrives.

use billing_engine::config::BillingConfig;
use billing_engine::services::TracingAuditSink;
use billing_engine::startup::BillingEngine;
use billing_engine::stores::{BillingStores, InMemoryStores};
use service_core::observability::init_tracing;
use std::sync::Arc;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = BillingConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )
    .map_err(|e| std::io::Error::other(format!("Tracing error: {}", e)))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.common.environment,
        "Starting billing-engine"
    );

    let stores = BillingStores::in_memory(Arc::new(InMemoryStores::new()));
    let engine = BillingEngine::new(config, stores, Arc::new(TracingAuditSink));

    let dispatcher = engine.start_dispatcher().await;
    let scheduler = engine.start_scheduler();

    shutdown_signal().await;

    dispatcher.shutdown().await;
    scheduler.stop().await;

    tracing::info!("billing-engine stopped");
    Ok(())
}
