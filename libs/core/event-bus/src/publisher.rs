//! Event publisher
//!
//! Publishes JSON events to a durable topic exchange. On connect it declares
//! the exchange and its queue bindings (`user-signuped` unless configured
//! otherwise), so messages published before a consumer starts are retained.
//!
//! # Example
//!
//! ```rust,ignore
//! use event_bus::{AmqpConnector, EventPublisher, PublisherConfig, Supervisor};
//!
//! let publisher = EventPublisher::new(
//!     Arc::new(AmqpConnector::new(&broker.url)),
//!     PublisherConfig::for_broker(&broker),
//! );
//! publisher.connect_with_retry(&Supervisor::default()).await?;
//!
//! publisher
//!     .publish_event("user-signuped", &UserSignedUp { user_id, email })
//!     .await?;
//! ```

use crate::config::PublisherConfig;
use crate::envelope::Envelope;
use crate::error::EventBusError;
use crate::event::Event;
use crate::metrics;
use crate::supervisor::Supervisor;
use crate::transport::{BrokerConnector, BrokerSession, ExchangeSpec, OutboundMessage, QueueSpec};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ROLE: &str = "publisher";

/// Publishes events over its own broker session.
pub struct EventPublisher {
    connector: Arc<dyn BrokerConnector>,
    config: PublisherConfig,
    session: RwLock<Option<Arc<dyn BrokerSession>>>,
}

impl EventPublisher {
    pub fn new(connector: Arc<dyn BrokerConnector>, config: PublisherConfig) -> Self {
        Self {
            connector,
            config,
            session: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Open a session and declare the exchange and bindings.
    ///
    /// A previously open session is replaced.
    pub async fn connect(&self) -> Result<(), EventBusError> {
        let session = self
            .connector
            .connect()
            .await
            .map_err(EventBusError::BrokerUnavailable)?;

        if let Err(e) = self.declare_topology(session.as_ref()).await {
            let _ = session.close().await;
            return Err(e);
        }

        let previous = self.session.write().await.replace(session);
        if let Some(previous) = previous {
            let _ = previous.close().await;
        }

        info!(
            broker = %self.connector.describe(),
            exchange = %self.config.exchange,
            bindings = self.config.bindings.len(),
            "Publisher connected"
        );
        Ok(())
    }

    /// [`EventPublisher::connect`] under the supervisor's retry policy
    pub async fn connect_with_retry(&self, supervisor: &Supervisor) -> Result<(), EventBusError> {
        supervisor.run(ROLE, || self.connect()).await
    }

    async fn declare_topology(&self, session: &dyn BrokerSession) -> Result<(), EventBusError> {
        session
            .declare_exchange(&ExchangeSpec::topic(self.config.exchange.clone()))
            .await
            .map_err(EventBusError::Topology)?;

        for binding in &self.config.bindings {
            session
                .declare_queue(&QueueSpec::new(binding.queue.clone(), binding.durable))
                .await
                .map_err(EventBusError::Topology)?;
            session
                .bind_queue(&binding.queue, &self.config.exchange, &binding.routing_key)
                .await
                .map_err(EventBusError::Topology)?;

            debug!(
                queue = %binding.queue,
                routing_key = %binding.routing_key,
                "Declared publisher binding"
            );
        }
        Ok(())
    }

    /// Whether a session is held and still open
    pub async fn is_connected(&self) -> bool {
        self.session
            .read()
            .await
            .as_ref()
            .is_some_and(|session| session.is_open())
    }

    /// Serialize `data` and publish it with routing key `event_name`.
    ///
    /// Serialization happens before anything touches the broker, so a
    /// payload that cannot be encoded sends nothing.
    /// Returns the envelope id.
    pub async fn publish_event<T>(&self, event_name: &str, data: &T) -> Result<Uuid, EventBusError>
    where
        T: Serialize + ?Sized,
    {
        let event = Event::new(event_name, data).inspect_err(|e| {
            metrics::record_published(event_name, false);
            warn!(event = event_name, error = %e, "Failed to serialize event");
        })?;
        self.publish(&event).await
    }

    /// Publish a prepared event. Returns the envelope id.
    pub async fn publish(&self, event: &Event) -> Result<Uuid, EventBusError> {
        let envelope = Envelope::wrap(event);
        let body = envelope.to_bytes()?;

        let Some(session) = self.session.read().await.clone() else {
            metrics::record_published(event.name(), false);
            return Err(EventBusError::Publish("publisher is not connected".to_string()));
        };

        let message = OutboundMessage {
            body,
            message_id: Some(envelope.id.to_string()),
            timestamp: u64::try_from(envelope.published_at.timestamp()).ok(),
            app_id: self.config.app_id.clone(),
        };

        match session
            .publish(&self.config.exchange, event.routing_key(), message)
            .await
        {
            Ok(()) => {
                metrics::record_published(event.name(), true);
                debug!(
                    event = %event.name(),
                    routing_key = %event.routing_key(),
                    message_id = %envelope.id,
                    "Published event"
                );
                Ok(envelope.id)
            }
            Err(e) => {
                metrics::record_published(event.name(), false);
                warn!(
                    event = %event.name(),
                    routing_key = %event.routing_key(),
                    error = %e,
                    "Failed to publish event"
                );
                if !session.is_open() {
                    self.forget(&session).await;
                }
                Err(EventBusError::Publish(e.to_string()))
            }
        }
    }

    /// Drop `session` if it is still the current one
    async fn forget(&self, session: &Arc<dyn BrokerSession>) {
        let mut current = self.session.write().await;
        if current.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *current = None;
            warn!("Publisher session lost; reconnect required");
        }
    }

    /// Close the session. Safe to call more than once.
    pub async fn dispose(&self) {
        let Some(session) = self.session.write().await.take() else {
            return;
        };

        if let Err(e) = session.close().await {
            debug!(error = %e, "Error closing publisher session");
        }
        info!("Publisher disposed");
    }
}
