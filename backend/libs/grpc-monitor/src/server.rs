//! Prometheus exposition endpoint

use crate::error::{MonitorError, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Router serving `GET /metrics` from `registry`
pub fn metrics_router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
}

/// Handler that serialises Prometheus metrics in text format.
async fn metrics_handler(State(registry): State<Registry>) -> Response {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }

    ([(header::CONTENT_TYPE, encoder.format_type())], buffer).into_response()
}

/// Serve the metrics endpoint on an already bound listener
pub async fn serve_metrics(listener: TcpListener, registry: Registry) -> Result<()> {
    axum::serve(listener, metrics_router(registry)).await?;
    Ok(())
}

/// Spawn the metrics endpoint on `0.0.0.0:port` on the current runtime
///
/// Returns immediately. Bind and serve failures are logged, not returned.
pub fn start_metrics_server(port: u16, registry: Registry) -> Result<JoinHandle<()>> {
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|e| MonitorError::Runtime(e.to_string()))?;

    Ok(handle.spawn(async move {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(%addr, error = %e, "Failed to bind metrics server");
                return;
            }
        };

        tracing::info!(%addr, "Metrics server listening");
        if let Err(e) = serve_metrics(listener, registry).await {
            tracing::error!(%addr, error = %e, "Metrics server stopped");
        }
    }))
}
