//! Minimal operational surface: liveness and Prometheus metrics. The
//! bridge itself has no request-serving API.

use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tracing::info;

pub async fn serve(address: SocketAddr) -> anyhow::Result<()> {
    let router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics));
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(%address, "serving health and metrics");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics() -> Result<String, StatusCode> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
