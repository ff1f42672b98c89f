//! Broker transport seam.
//!
//! The publisher and consumer talk to the broker only through [`BrokerConnector`]
//! and [`BrokerSession`]. Two implementations ship with the crate:
//!
//! - [`AmqpConnector`] (feature `amqp`, default): RabbitMQ via `lapin`
//! - [`InMemoryBroker`]: a topic-exchange simulation for tests and local runs

#[cfg(feature = "amqp")]
mod amqp;
mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use memory::{InMemoryBroker, QueueStats, topic_matches};

use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

/// Content type of every message published by this crate.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Durable topic exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Declared as the `x-dead-letter-exchange` argument
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, durable: bool) -> Self {
        Self {
            name: name.into(),
            durable,
            dead_letter_exchange: None,
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// Message handed to [`BrokerSession::publish`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch
    pub timestamp: Option<u64>,
    pub app_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;

    async fn nack(&self, requeue: bool) -> Result<(), TransportError>;
}

/// One message handed to the consumer.
///
/// `ack` and `nack` take the delivery by value, so it can be settled at most once.
pub struct Delivery {
    queue: String,
    delivery_tag: u64,
    routing_key: String,
    redelivered: bool,
    body: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        delivery_tag: u64,
        routing_key: impl Into<String>,
        redelivered: bool,
        body: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            queue: queue.into(),
            delivery_tag,
            routing_key: routing_key.into(),
            redelivered,
            body,
            acker,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Acknowledge: the broker removes the message.
    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    /// Reject: the broker requeues or dead-letters the message.
    pub async fn nack(self, requeue: bool) -> Result<(), TransportError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Deliveries from one or more queues. The stream ends when the session is lost.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Opens broker sessions. Every call yields a fresh connection with one channel.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, TransportError>;

    /// Human-readable target for logs (credentials redacted).
    fn describe(&self) -> String;
}

/// One connection plus its single channel, owned by one role.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TransportError>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Limit unacknowledged deliveries per consumer.
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Hand a message to the channel. Does not wait for broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
    -> Result<DeliveryStream, TransportError>;

    fn is_open(&self) -> bool;

    /// Close the channel, then the connection.
    async fn close(&self) -> Result<(), TransportError>;
}
