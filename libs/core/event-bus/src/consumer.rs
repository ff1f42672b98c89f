//! Event consumer
//!
//! Declares every queue in its [`QueueRegistry`], consumes them all over one
//! session and dispatches each delivery to the queue's handler.
//!
//! Each delivery is settled exactly once:
//! - handler succeeded: ack
//! - transient failure or timeout: nack, requeue per `requeue_on_failure`
//! - permanent failure (bad body, unknown queue, newer envelope, handler panic):
//!   nack without requeue
//!
//! When the connection drops, [`EventConsumer::run`] goes back through the
//! supervisor and re-declares everything. Deliveries not settled at that point
//! are redelivered by the broker, so handlers must be idempotent.

use crate::config::ConsumerConfig;
use crate::envelope;
use crate::error::{EventBusError, HandlerError};
use crate::metrics::{self, QueueMetrics};
use crate::registry::QueueRegistry;
use crate::supervisor::Supervisor;
use crate::transport::{BrokerConnector, BrokerSession, Delivery, DeliveryStream, ExchangeSpec};
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use strum::{AsRefStr, Display, EnumIter};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const ROLE: &str = "consumer";

/// Lifecycle of an [`EventConsumer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
    /// Stopped after a shutdown request; never left
    Terminated,
}

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Nacked { requeue: bool },
}

/// Why the delivery loop stopped
enum LoopExit {
    Shutdown,
    ConnectionLost,
}

pub struct EventConsumer {
    connector: Arc<dyn BrokerConnector>,
    registry: Arc<QueueRegistry>,
    config: Arc<ConsumerConfig>,
    state: watch::Sender<ConsumerState>,
    session: Mutex<Option<Arc<dyn BrokerSession>>>,
    permits: Arc<Semaphore>,
}

impl EventConsumer {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        registry: Arc<QueueRegistry>,
        config: ConsumerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_deliveries.max(1)));
        Self {
            connector,
            registry,
            config: Arc::new(config),
            state,
            session: Mutex::new(None),
            permits,
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Consumer state changed");
        }
        metrics::set_consumer_state(state);
    }

    /// Open a session, declare the exchange and every registered queue, then
    /// start consuming all of them.
    ///
    /// Consumption only starts after all declarations succeeded. The returned
    /// stream merges deliveries from every queue and ends when the session is lost.
    pub async fn connect(&self) -> Result<DeliveryStream, EventBusError> {
        if self.registry.is_empty() {
            return Err(EventBusError::Config("no queues registered".to_string()));
        }

        self.set_state(ConsumerState::Connecting);
        match self.open().await {
            Ok(deliveries) => {
                self.set_state(ConsumerState::Consuming);
                info!(
                    broker = %self.connector.describe(),
                    exchange = %self.config.exchange,
                    queues = ?self.registry.queue_names(),
                    prefetch = self.config.prefetch_count,
                    "Consumer connected"
                );
                Ok(deliveries)
            }
            Err(e) => {
                self.set_state(ConsumerState::Disconnected);
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<DeliveryStream, EventBusError> {
        let session = self
            .connector
            .connect()
            .await
            .map_err(EventBusError::BrokerUnavailable)?;

        let deliveries = match self.declare_and_consume(session.as_ref()).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                let _ = session.close().await;
                return Err(e);
            }
        };

        let previous = self.session.lock().await.replace(session);
        if let Some(previous) = previous {
            let _ = previous.close().await;
        }
        Ok(deliveries)
    }

    async fn declare_and_consume(
        &self,
        session: &dyn BrokerSession,
    ) -> Result<DeliveryStream, EventBusError> {
        let exchange = &self.config.exchange;

        session
            .declare_exchange(&ExchangeSpec::topic(exchange.clone()))
            .await
            .map_err(EventBusError::Topology)?;
        session
            .set_prefetch(self.config.prefetch_count)
            .await
            .map_err(EventBusError::Topology)?;

        for descriptor in self.registry.descriptors() {
            session
                .declare_queue(&descriptor.queue_spec())
                .await
                .map_err(EventBusError::Topology)?;
            for routing_key in descriptor.routing_keys() {
                session
                    .bind_queue(descriptor.name(), exchange, routing_key)
                    .await
                    .map_err(EventBusError::Topology)?;
            }
            debug!(
                queue = %descriptor.name(),
                durable = descriptor.durable(),
                routing_keys = ?descriptor.routing_keys(),
                "Queue declared"
            );
        }

        let mut streams = Vec::with_capacity(self.registry.len());
        for descriptor in self.registry.descriptors() {
            let tag = self.config.consumer_tag_for(descriptor.name());
            let stream = session
                .consume(descriptor.name(), &tag)
                .await
                .map_err(EventBusError::Topology)?;
            streams.push(stream);
        }

        Ok(futures::stream::select_all(streams).boxed())
    }

    /// Consume until `shutdown` turns true.
    ///
    /// Connects through `supervisor`, and goes back through it whenever the
    /// delivery stream ends. On shutdown, in-flight handlers get
    /// `shutdown_grace` to finish before the session is closed, even when every
    /// handler slot is taken.
    ///
    /// Errors that reconnecting cannot fix, such as an empty registry, are
    /// returned immediately.
    pub async fn run(
        &self,
        supervisor: &Supervisor,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EventBusError> {
        info!(
            queues = ?self.registry.queue_names(),
            exchange = %self.config.exchange,
            max_concurrent = self.config.max_concurrent_deliveries,
            handler_timeout_ms = self.config.handler_timeout.as_millis() as u64,
            "Starting event consumer"
        );

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            let deliveries = match supervisor
                .run_until_shutdown(ROLE, || self.connect(), &mut shutdown)
                .await
            {
                Ok(deliveries) => deliveries,
                Err(EventBusError::Shutdown) => break Ok(()),
                Err(e) => break Err(e),
            };

            match self.consume(deliveries, &mut shutdown).await {
                LoopExit::Shutdown => break Ok(()),
                LoopExit::ConnectionLost => {
                    warn!("Broker connection lost, reconnecting");
                    self.release_session().await;
                    self.set_state(ConsumerState::Disconnected);
                }
            }
        };

        self.dispose().await;
        match &result {
            Ok(()) => {
                self.set_state(ConsumerState::Terminated);
                info!("Event consumer stopped");
            }
            Err(e) => error!(error = %e, "Event consumer stopped"),
        }
        result
    }

    /// Pull deliveries and dispatch them until the stream ends or shutdown
    async fn consume(
        &self,
        mut deliveries: DeliveryStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LoopExit {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut shutdown_open = true;
        // A delivery is only pulled while a handler slot is reserved
        let mut permit: Option<OwnedSemaphorePermit> = None;

        let exit = loop {
            tokio::select! {
                changed = shutdown.changed(), if shutdown_open => match changed {
                    Ok(()) if *shutdown.borrow() => {
                        info!("Received shutdown signal, stopping consumer");
                        break LoopExit::Shutdown;
                    }
                    Ok(()) => {}
                    Err(_) => shutdown_open = false,
                },
                acquired = Arc::clone(&self.permits).acquire_owned(), if permit.is_none() => {
                    match acquired {
                        Ok(acquired) => permit = Some(acquired),
                        Err(_) => {
                            error!("Delivery permits closed, stopping consumer");
                            break LoopExit::Shutdown;
                        }
                    }
                }
                next = deliveries.next(), if permit.is_some() => match next {
                    Some(Ok(delivery)) => {
                        self.spawn_delivery(&mut in_flight, delivery, permit.take());
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Delivery stream failed");
                        break LoopExit::ConnectionLost;
                    }
                    None => break LoopExit::ConnectionLost,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Delivery task failed");
                    }
                    metrics::set_in_flight_deliveries(in_flight.len());
                }
            }
        };

        // Stop taking deliveries before waiting on the ones in flight
        drop(deliveries);
        self.drain(in_flight).await;
        exit
    }

    fn spawn_delivery(
        &self,
        in_flight: &mut JoinSet<()>,
        delivery: Delivery,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);
        in_flight.spawn(async move {
            let _permit = permit;
            Self::handle_delivery(&registry, &config, delivery).await;
        });
        metrics::set_in_flight_deliveries(in_flight.len());
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }

        let pending = in_flight.len();
        debug!(pending, "Waiting for in-flight deliveries");

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Delivery task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = in_flight.len(),
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "Grace period elapsed; abandoning in-flight deliveries to broker redelivery"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }
        metrics::set_in_flight_deliveries(0);
    }

    /// Dispatch one delivery to its handler and settle it.
    ///
    /// A failed ack/nack is logged; the broker redelivers such messages.
    pub async fn handle_delivery(
        registry: &QueueRegistry,
        config: &ConsumerConfig,
        delivery: Delivery,
    ) -> DeliveryOutcome {
        let queue = delivery.queue().to_string();
        let delivery_tag = delivery.delivery_tag();
        let redelivered = delivery.redelivered();
        let metrics = QueueMetrics::new(&queue);
        metrics.delivery_received();

        let start = Instant::now();
        let result = Self::invoke_handler(registry, config, &queue, delivery.body()).await;
        let elapsed = start.elapsed();

        match result {
            Ok(()) => {
                metrics.delivery_acked(elapsed);
                match delivery.ack().await {
                    Ok(()) => debug!(
                        queue = %queue,
                        delivery_tag,
                        duration_ms = elapsed.as_millis() as u64,
                        "Delivery acknowledged"
                    ),
                    Err(e) => {
                        metrics.settle_failed();
                        warn!(queue = %queue, delivery_tag, error = %e, "Failed to ack delivery");
                    }
                }
                DeliveryOutcome::Acked
            }
            Err(e) => {
                let category = e.category();
                let requeue = category.allows_requeue() && config.requeue_on_failure;
                if matches!(e, EventBusError::HandlerTimeout { .. }) {
                    metrics.handler_timed_out();
                }
                metrics.delivery_nacked(category, requeue, elapsed);

                if category.allows_requeue() {
                    warn!(
                        queue = %queue,
                        delivery_tag,
                        redelivered,
                        requeue,
                        error = %e,
                        "Delivery failed"
                    );
                } else {
                    error!(
                        queue = %queue,
                        delivery_tag,
                        redelivered,
                        error = %e,
                        "Delivery rejected permanently"
                    );
                }

                if let Err(nack_err) = delivery.nack(requeue).await {
                    metrics.settle_failed();
                    warn!(queue = %queue, delivery_tag, error = %nack_err, "Failed to nack delivery");
                }
                DeliveryOutcome::Nacked { requeue }
            }
        }
    }

    async fn invoke_handler(
        registry: &QueueRegistry,
        config: &ConsumerConfig,
        queue: &str,
        body: &[u8],
    ) -> Result<(), EventBusError> {
        let message = envelope::decode(body)
            .map_err(|e| EventBusError::handler(queue, HandlerError::permanent(e.to_string())))?;
        let handler = registry.resolve(queue)?;

        debug!(
            queue,
            handler = handler.name(),
            event = message.event.as_deref().unwrap_or(queue),
            version = message.version,
            "Dispatching delivery"
        );

        let invocation = AssertUnwindSafe(handler.handle(message.payload)).catch_unwind();
        match tokio::time::timeout(config.handler_timeout, invocation).await {
            Err(_) => Err(EventBusError::HandlerTimeout {
                queue: queue.to_string(),
                timeout: config.handler_timeout,
            }),
            Ok(Err(panic)) => Err(EventBusError::handler(
                queue,
                HandlerError::permanent(format!(
                    "handler '{}' panicked: {}",
                    handler.name(),
                    panic_message(panic.as_ref())
                )),
            )),
            Ok(Ok(result)) => result.map_err(|e| EventBusError::handler(queue, e)),
        }
    }

    async fn release_session(&self) {
        if let Some(session) = self.session.lock().await.take() {
            let _ = session.close().await;
        }
    }

    /// Close the session. Safe to call more than once, in any state.
    pub async fn dispose(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                debug!(error = %e, "Error closing consumer session");
            }
            info!("Consumer disposed");
        }

        if self.state() != ConsumerState::Terminated {
            self.set_state(ConsumerState::Disconnected);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
