//! Events Worker Service
//!
//! A background worker that consumes domain events from RabbitMQ.
//!
//! ## Architecture
//!
//! ```text
//! Topic exchange (user_events)
//!   ↓ (one durable queue per event, bound by event name)
//! EventConsumer (prefetch + bounded concurrency)
//!   ↓ (QueueRegistry resolves the handler)
//! WelcomeEmailHandler / TaskActivityHandler
//!   ↓
//! ack, or nack (requeue for transient failures, dead-letter otherwise)
//! ```
//!
//! ## Features
//!
//! - Reconnect supervisor around every broker connection
//! - Per-handler timeout, panic isolation
//! - Graceful shutdown with an in-flight grace period
//! - Health check endpoint for Kubernetes probes

use axum::Router;
use core_config::server::ServerConfig;
use core_config::{ConfigError, Environment, FromEnv, env_or_default};
use domain_notifications::{
    LogEmailSender, LogTaskNotifier, NotificationHandlers, WelcomeEmailSettings,
};
use event_bus::{
    AmqpConnector, BrokerConfig, ConsumerConfig, EventConsumer, HealthState, QueueRegistry,
    RetryPolicy, Supervisor, health_router,
};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start the health HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Queue listing: `/queues`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState, config: ServerConfig) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(address = %addr, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Welcome email settings from `DASHBOARD_URL` and `COMPANY_NAME`
fn welcome_settings_from_env() -> WelcomeEmailSettings {
    let defaults = WelcomeEmailSettings::default();
    WelcomeEmailSettings {
        dashboard_url: env_or_default("DASHBOARD_URL", &defaults.dashboard_url),
        company_name: env_or_default("COMPANY_NAME", &defaults.company_name),
    }
}

/// Health listener from `EVENTS_WORKER_HEALTH_PORT`, falling back to `HEALTH_PORT` (default 8082)
fn health_server_config() -> Result<ServerConfig, ConfigError> {
    let port_key = if std::env::var("EVENTS_WORKER_HEALTH_PORT").is_ok() {
        "EVENTS_WORKER_HEALTH_PORT"
    } else {
        "HEALTH_PORT"
    };
    ServerConfig::from_env_keys("HEALTH_HOST", port_key, 8082)
}

/// Run the events worker
///
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Loads broker, consumer and retry configuration
/// 3. Registers one queue per domain event
/// 4. Consumes until SIGINT/SIGTERM, reconnecting whenever the broker goes away
///
/// # Errors
///
/// Returns an error if configuration is invalid, the queue registry cannot be
/// built, or a bounded retry policy gives up on the broker.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    event_bus::init_metrics();

    info!(name = APP_NAME, version = APP_VERSION, "Starting events worker service");
    info!("Environment: {:?}", environment);

    let broker = BrokerConfig::from_env().wrap_err("Failed to load broker configuration")?;
    let consumer_config =
        ConsumerConfig::from_env().wrap_err("Failed to load consumer configuration")?;
    let retry_policy = RetryPolicy::from_env().wrap_err("Failed to load retry policy")?;
    let health_config =
        health_server_config().wrap_err("Failed to load health server configuration")?;

    info!(
        broker = %broker.redacted_url(),
        exchange = %consumer_config.exchange,
        prefetch = consumer_config.prefetch_count,
        max_concurrent = consumer_config.max_concurrent_deliveries,
        retry = ?retry_policy,
        "Worker configuration loaded"
    );

    let registry = NotificationHandlers::new(Arc::new(LogEmailSender), Arc::new(LogTaskNotifier))
        .wrap_err("Failed to initialize notification handlers")?
        .with_welcome_settings(welcome_settings_from_env())
        .register(QueueRegistry::builder())
        .build()
        .wrap_err("Failed to build queue registry")?;

    let connector = AmqpConnector::new(broker.url.clone()).with_connection_name(APP_NAME);
    let consumer = EventConsumer::new(Arc::new(connector), Arc::new(registry), consumer_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let health_state = HealthState::new(&consumer, APP_NAME, APP_VERSION);
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_config).await {
            error!(error = %e, "Health server failed");
        }
    });

    let supervisor = Supervisor::new(retry_policy);
    consumer
        .run(&supervisor, shutdown_rx)
        .await
        .wrap_err("Event consumer stopped with an error")?;

    info!("Events worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
