//! Metrics HTTP server
//!
//! Serves the latest [`MetricsSnapshot`] as JSON, whole or by section.

use axum::{extract::State, routing::get, Json, Router};
use thiserror::Error;
use tracing::info;

use crate::metrics::{MetricsSnapshot, PerformanceMetrics, QueueStatus, SharedMetrics};

/// Errors that can occur when running the metrics server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Metrics server failed: {0}")]
    Serve(#[from] std::io::Error),
}

/// GET /metrics
async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<MetricsSnapshot> {
    let snapshot = metrics.read().await.clone();
    Json(snapshot)
}

/// GET /queue
async fn get_queue(State(metrics): State<SharedMetrics>) -> Json<QueueStatus> {
    Json(metrics.read().await.queue.clone())
}

/// GET /performance
async fn get_performance(State(metrics): State<SharedMetrics>) -> Json<PerformanceMetrics> {
    Json(metrics.read().await.performance.clone())
}

/// Creates the axum Router with the metrics endpoints
pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/queue", get(get_queue))
        .route("/performance", get(get_performance))
        .with_state(metrics)
}

/// Runs the metrics HTTP server on `bind` until the task is dropped
pub async fn run_metrics_server(metrics: SharedMetrics, bind: &str) -> Result<(), ServerError> {
    let app = create_metrics_router(metrics);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    info!(addr = %bind, "Metrics server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
