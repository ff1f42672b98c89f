//! Prometheus metrics for the event bus
//!
//! Counters are recorded through the `metrics` facade and are no-ops until
//! [`init_metrics`] installs the Prometheus recorder.

use crate::consumer::ConsumerState;
use crate::error::ErrorCategory;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use strum::IntoEnumIterator;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. If another recorder
/// is already installed the failure is logged and metrics stay disabled.
pub fn init_metrics() {
    let result = PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
    });

    if let Err(e) = result {
        warn!(error = %e, "Failed to install Prometheus recorder");
    }
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Record a publish attempt
pub fn record_published(event: &str, success: bool) {
    counter!(
        "event_bus_events_published_total",
        "event" => event.to_string(),
        "status" => if success { "success" } else { "failed" }
    )
    .increment(1);
}

/// Record a broker connection attempt for `role` (`publisher` / `consumer`)
pub fn record_connection_attempt(role: &str, success: bool) {
    counter!(
        "event_bus_connection_attempts_total",
        "role" => role.to_string(),
        "result" => if success { "success" } else { "failed" }
    )
    .increment(1);
}

/// Set the consumer state gauge: 1 for the current state, 0 for the others
pub fn set_consumer_state(current: ConsumerState) {
    for state in ConsumerState::iter() {
        gauge!("event_bus_consumer_state", "state" => state.as_ref().to_string())
            .set(if state == current { 1.0 } else { 0.0 });
    }
}

/// Number of handler tasks currently running
pub fn set_in_flight_deliveries(count: usize) {
    gauge!("event_bus_in_flight_deliveries").set(count as f64);
}

/// Per-queue delivery metrics
#[derive(Clone)]
pub struct QueueMetrics {
    queue: String,
}

impl QueueMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// Record a delivery being received
    pub fn delivery_received(&self) {
        counter!(
            "event_bus_deliveries_received_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record a delivery handled successfully and acked
    pub fn delivery_acked(&self, duration: Duration) {
        counter!(
            "event_bus_deliveries_total",
            "queue" => self.queue.clone(),
            "outcome" => "acked"
        )
        .increment(1);

        self.handler_duration(duration);
    }

    /// Record a delivery that was nacked
    pub fn delivery_nacked(&self, category: ErrorCategory, requeue: bool, duration: Duration) {
        counter!(
            "event_bus_deliveries_total",
            "queue" => self.queue.clone(),
            "outcome" => if requeue { "requeued" } else { "rejected" }
        )
        .increment(1);

        counter!(
            "event_bus_delivery_errors_total",
            "queue" => self.queue.clone(),
            "category" => category.as_ref().to_string()
        )
        .increment(1);

        self.handler_duration(duration);
    }

    /// Record a handler that hit its timeout
    pub fn handler_timed_out(&self) {
        counter!(
            "event_bus_handler_timeouts_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record a settlement (ack/nack) the broker did not accept
    pub fn settle_failed(&self) {
        counter!(
            "event_bus_settle_failures_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    fn handler_duration(&self, duration: Duration) {
        histogram!(
            "event_bus_handler_duration_seconds",
            "queue" => self.queue.clone()
        )
        .record(duration.as_secs_f64());
    }
}
