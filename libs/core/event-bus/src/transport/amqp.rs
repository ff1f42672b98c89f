//! RabbitMQ transport built on `lapin`.

use super::{
    Acknowledger, BrokerConnector, BrokerSession, Delivery, DeliveryStream, ExchangeSpec,
    JSON_CONTENT_TYPE, OutboundMessage, QueueSpec,
};
use crate::config::redact_url;
use crate::error::TransportError;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use tracing::{debug, warn};

/// Persistent delivery mode
const PERSISTENT: u8 = 2;

/// AMQP reply code for a normal close
const REPLY_SUCCESS: u16 = 200;

fn channel_error(err: lapin::Error) -> TransportError {
    TransportError::Channel(err.to_string())
}

/// Opens one AMQP connection with a single channel per `connect()` call.
#[derive(Clone)]
pub struct AmqpConnector {
    url: String,
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_name: "event-bus".to_string(),
        }
    }

    /// Name shown in the RabbitMQ management UI
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, TransportError> {
        let properties =
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into());

        let connection = Connection::connect(&self.url, properties)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        connection.on_error(|err| {
            warn!(error = %err, "AMQP connection error");
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        debug!(
            url = %redact_url(&self.url),
            connection_name = %self.connection_name,
            channel_id = channel.id(),
            "AMQP connection established"
        );

        Ok(Arc::new(AmqpSession {
            connection,
            channel,
        }))
    }

    fn describe(&self) -> String {
        redact_url(&self.url)
    }
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                &exchange.name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), TransportError> {
        let mut arguments = FieldTable::default();
        if let Some(dlx) = &queue.dead_letter_exchange {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dlx.as_str().into()),
            );
        }

        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(channel_error)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }

        let mut properties = BasicProperties::default()
            .with_content_type(JSON_CONTENT_TYPE.into())
            .with_delivery_mode(PERSISTENT);
        if let Some(id) = message.message_id {
            properties = properties.with_message_id(id.into());
        }
        if let Some(timestamp) = message.timestamp {
            properties = properties.with_timestamp(timestamp);
        }
        if let Some(app_id) = message.app_id {
            properties = properties.with_app_id(app_id.into());
        }

        // Confirms are not enabled on the channel, so the returned confirm is already resolved
        let _confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(channel_error)?;

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;

        let queue = queue.to_string();
        let stream = consumer.map(move |result| {
            result
                .map(|mut delivery| {
                    let body = std::mem::take(&mut delivery.data);
                    let routing_key = delivery.routing_key.to_string();
                    let (delivery_tag, redelivered) = (delivery.delivery_tag, delivery.redelivered);
                    Delivery::new(
                        queue.clone(),
                        delivery_tag,
                        routing_key,
                        redelivered,
                        body,
                        Box::new(AmqpAcker { delivery }),
                    )
                })
                .map_err(|e| TransportError::Connection(e.to_string()))
        });

        Ok(stream.boxed())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "closing")
                .await
                .map_err(channel_error)?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "closing")
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
        }
        Ok(())
    }
}

struct AmqpAcker {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(channel_error)
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.delivery
            .acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map(|_| ())
            .map_err(channel_error)
    }
}
