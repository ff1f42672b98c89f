//! Event Bus
//!
//! Publish/subscribe over a durable topic exchange (RabbitMQ via AMQP 0.9.1).
//!
//! ## Features
//!
//! - **Publisher**: JSON events in a versioned envelope, routing key = event name
//! - **Queue registry**: explicit queue → handler table handed to the consumer
//! - **Consumer**: declares all queues, bounded concurrent dispatch, ack/nack exactly once
//! - **Reconnect supervisor**: fixed or exponential backoff, optional jitter and attempt cap
//! - **Prometheus metrics** and **health endpoints** for K8s probes
//! - **In-memory broker** for tests and local runs
//!
//! ## Example
//!
//! ```ignore
//! use event_bus::{
//!     AmqpConnector, BrokerConfig, ConsumerConfig, EventConsumer, QueueRegistry, Supervisor,
//! };
//!
//! let broker = BrokerConfig::from_env()?;
//! let registry = QueueRegistry::builder()
//!     .register("user-signuped", true, WelcomeEmailHandler::new(sender))
//!     .build()?;
//!
//! let consumer = EventConsumer::new(
//!     Arc::new(AmqpConnector::new(&broker.url)),
//!     Arc::new(registry),
//!     ConsumerConfig::for_broker(&broker),
//! );
//! consumer.run(&Supervisor::default(), shutdown_rx).await?;
//! ```

pub mod config;
mod consumer;
pub mod envelope;
mod error;
mod event;
mod health;
pub mod metrics;
mod publisher;
mod registry;
mod supervisor;
pub mod transport;

// Re-export main types
pub use config::{
    BrokerConfig, ConsumerConfig, DEFAULT_EXCHANGE, DEFAULT_PUBLISHER_QUEUE, PublisherConfig,
    QueueBinding,
};
pub use consumer::{ConsumerState, DeliveryOutcome, EventConsumer};
pub use envelope::{Envelope, SCHEMA_VERSION};
pub use error::{ErrorCategory, EventBusError, HandlerError, TransportError};
pub use event::Event;
pub use health::{HealthState, health_router};
pub use metrics::{QueueMetrics, init_metrics};
pub use publisher::EventPublisher;
pub use registry::{EventHandler, FnHandler, QueueDescriptor, QueueRegistry, QueueRegistryBuilder, handler_fn};
pub use supervisor::{Backoff, DEFAULT_RETRY_INTERVAL, RetryPolicy, Supervisor};
#[cfg(feature = "amqp")]
pub use transport::AmqpConnector;
pub use transport::{BrokerConnector, BrokerSession, InMemoryBroker};
