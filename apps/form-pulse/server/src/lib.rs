//! Form Pulse analytics server.
//!
//! Browser sessions stream form events over `/ws`; the gateway keeps their
//! ephemeral sessions, the aggregator folds events into durable metrics and
//! the broadcaster pushes fresh snapshots to every observer of a form.

use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

pub mod aggregator;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod presence;
pub mod retry;
pub mod session;
pub mod store;
pub mod telemetry;
mod ws;

use crate::aggregator::MetricsAggregator;
use crate::config::{ServerConfig, StoreBackend};
use crate::gateway::FormGateway;
use crate::http::AppState;
use crate::store::{MemoryStore, MetricsStore, RedisStore};

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let store: Arc<dyn MetricsStore> = match &config.store {
        StoreBackend::Redis { url } => Arc::new(
            RedisStore::connect(url)
                .await
                .context("failed to connect to redis")?,
        ),
        StoreBackend::Memory => {
            info!("using in-memory metrics store; data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };
    let aggregator = MetricsAggregator::new(store, config.retry);
    let gateway = FormGateway::new(aggregator, config.gateway.clone());
    let router = http::router(AppState { gateway, metrics });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("form-pulse listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
