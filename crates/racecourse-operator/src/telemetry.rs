use std::net::SocketAddr;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{histogram_opts, opts, Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder};
use tracing::info;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static RECONCILES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("racecourse_reconcile_total", "Reconcile passes by outcome"), &["outcome"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RECONCILE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(
        histogram_opts!("racecourse_reconcile_duration_seconds", "Reconcile pass latency", vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["outcome"],
    ).unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

pub static CHILD_WRITES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("racecourse_child_operations_total", "Child create-or-update results by kind"), &["kind", "op"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() { return StatusCode::INTERNAL_SERVER_ERROR.into_response(); }
    ([("Content-Type", "text/plain; version=0.0.4")], buf).into_response()
}

pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
}

pub async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics listening");
    axum::serve(listener, router()).await?;
    Ok(())
}
