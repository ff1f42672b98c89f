//! Queue registry: the queues a consumer declares and the handler for each.
//!
//! The registry is built once, before the consumer starts, and handed to the
//! consumer explicitly. There is no process-wide handler table.
//!
//! # Example
//!
//! ```rust,ignore
//! use event_bus::{QueueRegistry, handler_fn};
//!
//! let registry = QueueRegistry::builder()
//!     .register("user-signuped", true, handler_fn("welcome", |payload| async move {
//!         tracing::info!(?payload, "new user");
//!         Ok(())
//!     }))
//!     .build()?;
//! ```

use crate::error::{EventBusError, HandlerError};
use crate::transport::QueueSpec;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Processes the payload of one delivery.
///
/// Return [`HandlerError::transient`] for failures worth retrying and
/// [`HandlerError::permanent`] for payloads that will never succeed.
/// Deliveries may be redelivered, so handlers must be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<(), HandlerError>;

    /// Name used in logs
    fn name(&self) -> &'static str {
        "handler"
    }
}

/// Handler backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F> {
    name: &'static str,
    f: F,
}

/// Wrap an async closure as an [`EventHandler`]
pub fn handler_fn<F, Fut>(name: &'static str, f: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { name, f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, payload: Value) -> Result<(), HandlerError> {
        (self.f)(payload).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// One queue to declare, bind and consume.
#[derive(Clone)]
pub struct QueueDescriptor {
    name: String,
    durable: bool,
    routing_keys: Vec<String>,
    dead_letter_exchange: Option<String>,
    handler: Arc<dyn EventHandler>,
}

impl QueueDescriptor {
    /// Queue bound with a routing key equal to its name
    pub fn new(name: impl Into<String>, durable: bool, handler: impl EventHandler + 'static) -> Self {
        Self::with_handler(name, durable, Arc::new(handler))
    }

    pub fn with_handler(name: impl Into<String>, durable: bool, handler: Arc<dyn EventHandler>) -> Self {
        let name = name.into();
        Self {
            routing_keys: vec![name.clone()],
            name,
            durable,
            dead_letter_exchange: None,
            handler,
        }
    }

    /// Replace the bindings with the given routing keys (topic patterns allowed)
    pub fn with_routing_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routing_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Declare the queue without binding it to the exchange
    pub fn unbound(mut self) -> Self {
        self.routing_keys.clear();
        self
    }

    /// Dead-letter exchange for rejected messages
    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn routing_keys(&self) -> &[String] {
        &self.routing_keys
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }

    /// Declaration sent to the broker
    pub fn queue_spec(&self) -> QueueSpec {
        let spec = QueueSpec::new(self.name.clone(), self.durable);
        match &self.dead_letter_exchange {
            Some(dlx) => spec.with_dead_letter_exchange(dlx.clone()),
            None => spec,
        }
    }
}

impl fmt::Debug for QueueDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDescriptor")
            .field("name", &self.name)
            .field("durable", &self.durable)
            .field("routing_keys", &self.routing_keys)
            .field("dead_letter_exchange", &self.dead_letter_exchange)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Immutable set of queue descriptors, in registration order.
#[derive(Clone, Debug, Default)]
pub struct QueueRegistry {
    queues: Vec<QueueDescriptor>,
    index: HashMap<String, usize>,
}

impl QueueRegistry {
    pub fn builder() -> QueueRegistryBuilder {
        QueueRegistryBuilder::default()
    }

    /// Handler for `queue`
    pub fn resolve(&self, queue: &str) -> Result<Arc<dyn EventHandler>, EventBusError> {
        self.get(queue)
            .map(|descriptor| Arc::clone(&descriptor.handler))
            .ok_or_else(|| EventBusError::UnknownQueue(queue.to_string()))
    }

    pub fn get(&self, queue: &str) -> Option<&QueueDescriptor> {
        self.index.get(queue).map(|&i| &self.queues[i])
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &QueueDescriptor> {
        self.queues.iter()
    }

    pub fn queue_names(&self) -> Vec<&str> {
        self.queues.iter().map(|q| q.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[derive(Default)]
pub struct QueueRegistryBuilder {
    queues: Vec<QueueDescriptor>,
}

impl QueueRegistryBuilder {
    /// Register a queue bound with a routing key equal to its name
    pub fn register(
        self,
        name: impl Into<String>,
        durable: bool,
        handler: impl EventHandler + 'static,
    ) -> Self {
        self.queue(QueueDescriptor::new(name, durable, handler))
    }

    pub fn queue(mut self, descriptor: QueueDescriptor) -> Self {
        self.queues.push(descriptor);
        self
    }

    /// Fails on an empty or duplicated queue name
    pub fn build(self) -> Result<QueueRegistry, EventBusError> {
        let mut index = HashMap::with_capacity(self.queues.len());
        for (i, descriptor) in self.queues.iter().enumerate() {
            if descriptor.name.is_empty() {
                return Err(EventBusError::Config("queue name must not be empty".to_string()));
            }
            if index.insert(descriptor.name.clone(), i).is_some() {
                return Err(EventBusError::DuplicateQueue(descriptor.name.clone()));
            }
        }

        Ok(QueueRegistry {
            queues: self.queues,
            index,
        })
    }
}
