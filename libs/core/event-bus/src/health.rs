//! Health check handlers for event consumers.
//!
//! This module provides reusable Axum handlers for:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`): ready only while consuming
//! - Queue listing (`/queues`)
//! - Prometheus metrics (`/metrics`)

use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::consumer::{ConsumerState, EventConsumer};
use crate::metrics;
use crate::registry::QueueRegistry;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
    /// Exchange the consumer is bound to.
    pub exchange: String,
    consumer_state: watch::Receiver<ConsumerState>,
    registry: Arc<QueueRegistry>,
}

impl HealthState {
    /// Health state that follows `consumer`.
    pub fn new(
        consumer: &EventConsumer,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self::from_parts(
            consumer.subscribe_state(),
            Arc::clone(consumer.registry()),
            consumer.config().exchange.clone(),
            app_name,
            app_version,
        )
    }

    pub fn from_parts(
        consumer_state: watch::Receiver<ConsumerState>,
        registry: Arc<QueueRegistry>,
        exchange: impl Into<String>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            exchange: exchange.into(),
            consumer_state,
            registry,
        }
    }

    pub fn consumer_state(&self) -> ConsumerState {
        *self.consumer_state.borrow()
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: String,
    pub name: String,
    pub version: String,
    /// Current consumer state.
    pub consumer: String,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running, whatever the broker state.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        consumer: state.consumer_state().to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Ready only while the consumer is consuming.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let consumer = state.consumer_state();
    let body = json!({
        "status": if consumer == ConsumerState::Consuming { "ready" } else { "not_ready" },
        "checks": {
            "consumer": consumer.as_ref(),
        }
    });

    if consumer == ConsumerState::Consuming {
        Ok((StatusCode::OK, Json(body)))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(body)))
    }
}

/// Registered queues with their bindings and handlers.
pub async fn queues_handler(State(state): State<HealthState>) -> Json<Value> {
    let queues: Vec<Value> = state
        .registry
        .descriptors()
        .map(|q| {
            json!({
                "name": q.name(),
                "durable": q.durable(),
                "routing_keys": q.routing_keys(),
                "dead_letter_exchange": q.dead_letter_exchange(),
                "handler": q.handler().name(),
            })
        })
        .collect();

    Json(json!({
        "exchange": state.exchange,
        "queues": queues,
    }))
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Create a standard health router.
///
/// - `/health`, `/healthz` - Liveness probe
/// - `/ready`, `/readyz` - Readiness probe
/// - `/queues` - Registered queues
/// - `/metrics` - Prometheus metrics
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/queues", get(queues_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
