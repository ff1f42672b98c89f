//! End-to-end publisher/consumer tests against the in-memory broker.

use event_bus::transport::{BrokerConnector, OutboundMessage};
use event_bus::{
    ConsumerConfig, ConsumerState, DeliveryOutcome, EventBusError, EventConsumer, EventPublisher,
    HandlerError, InMemoryBroker, PublisherConfig, QueueDescriptor, QueueRegistry, RetryPolicy,
    Supervisor, handler_fn,
};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;

const EXCHANGE: &str = "user_events";
const WAIT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UserSignedUp {
    user_id: String,
    email: String,
}

struct Running {
    broker: InMemoryBroker,
    consumer: Arc<EventConsumer>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<(), EventBusError>>,
}

impl Running {
    async fn start(broker: InMemoryBroker, registry: QueueRegistry, config: ConsumerConfig) -> Self {
        let consumer = Arc::new(EventConsumer::new(
            Arc::new(broker.clone()),
            Arc::new(registry),
            config,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor::new(RetryPolicy::fixed(Duration::from_millis(10)));

        let task = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run(&supervisor, shutdown_rx).await })
        };

        let running = Self {
            broker,
            consumer,
            shutdown_tx,
            task,
        };
        running.wait_for_state(ConsumerState::Consuming).await;
        running
    }

    async fn wait_for_state(&self, state: ConsumerState) {
        let mut rx = self.consumer.subscribe_state();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for consumer state")
            .expect("consumer dropped");
    }

    async fn publisher(&self) -> EventPublisher {
        let publisher = EventPublisher::new(
            Arc::new(self.broker.clone()),
            PublisherConfig::new(EXCHANGE),
        );
        publisher.connect().await.unwrap();
        publisher
    }

    async fn stop(self) -> Result<(), EventBusError> {
        let _ = self.shutdown_tx.send(true);
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("consumer did not stop")
            .expect("consumer task panicked")
    }
}

async fn wait_queue<F>(broker: &InMemoryBroker, queue: &str, predicate: F) -> event_bus::transport::QueueStats
where
    F: Fn(&event_bus::transport::QueueStats) -> bool,
{
    tokio::time::timeout(WAIT, broker.wait_for_queue(queue, predicate))
        .await
        .expect("timed out waiting for queue")
}

fn ok_handler(calls: Arc<AtomicUsize>) -> impl event_bus::EventHandler {
    handler_fn("count", move |_: Value| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

async fn explode(_: Value) -> Result<(), HandlerError> {
    panic!("handler bug")
}

#[tokio::test]
async fn test_round_trip_acks_exactly_once() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let registry = QueueRegistry::builder()
        .register(
            "user-signuped",
            true,
            handler_fn("capture", move |payload: Value| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(payload);
                    Ok(())
                }
            }),
        )
        .build()
        .unwrap();
    let running = Running::start(InMemoryBroker::new(), registry, ConsumerConfig::new(EXCHANGE)).await;

    let publisher = running.publisher().await;
    publisher
        .publish_event(
            "user-signuped",
            &UserSignedUp {
                user_id: "u-1".into(),
                email: "ada@example.com".into(),
            },
        )
        .await
        .unwrap();

    let payload = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(payload, json!({"UserId": "u-1", "Email": "ada@example.com"}));

    let stats = wait_queue(&running.broker, "user-signuped", |s| s.acked == 1).await;
    assert_eq!(stats.nacked, 0);
    assert_eq!(stats.unacked, 0);
    assert_eq!(stats.delivered, 1);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_transient_failure_is_requeued_then_succeeds() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let registry = QueueRegistry::builder()
        .register(
            "task-created",
            true,
            handler_fn("flaky", move |_: Value| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(HandlerError::transient("smtp unavailable"))
                    } else {
                        Ok(())
                    }
                }
            }),
        )
        .build()
        .unwrap();
    let running = Running::start(InMemoryBroker::new(), registry, ConsumerConfig::new(EXCHANGE)).await;

    running
        .publisher()
        .await
        .publish_event("task-created", &json!({"TaskId": "t-1"}))
        .await
        .unwrap();

    let stats = wait_queue(&running.broker, "task-created", |s| s.acked == 1).await;
    assert_eq!(stats.nacked, 1);
    assert_eq!(stats.requeued, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_transient_failure_without_requeue_is_dropped() {
    let registry = QueueRegistry::builder()
        .register(
            "task-created",
            true,
            handler_fn("failing", |_: Value| async {
                Err(HandlerError::transient("downstream unavailable"))
            }),
        )
        .build()
        .unwrap();
    let config = ConsumerConfig::new(EXCHANGE).with_requeue_on_failure(false);
    let running = Running::start(InMemoryBroker::new(), registry, config).await;

    running
        .publisher()
        .await
        .publish_event("task-created", &json!({}))
        .await
        .unwrap();

    let stats = wait_queue(&running.broker, "task-created", |s| s.nacked == 1).await;
    assert_eq!(stats.requeued, 0);
    assert_eq!(stats.discarded, 1);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_permanent_failure_goes_to_dead_letter_exchange() {
    let broker = InMemoryBroker::new();
    let registry = QueueRegistry::builder()
        .queue(
            QueueDescriptor::new(
                "user-signuped",
                true,
                handler_fn("reject", |_: Value| async {
                    Err(HandlerError::permanent("invalid email"))
                }),
            )
            .with_dead_letter_exchange("user_events.dlx"),
        )
        .build()
        .unwrap();

    // Dead-letter topology is owned by operations, not by the consumer
    let admin = broker.connect().await.unwrap();
    admin
        .declare_exchange(&event_bus::transport::ExchangeSpec::topic("user_events.dlx"))
        .await
        .unwrap();
    admin
        .declare_queue(&event_bus::transport::QueueSpec::new("user-signuped.dead", true))
        .await
        .unwrap();
    admin
        .bind_queue("user-signuped.dead", "user_events.dlx", "#")
        .await
        .unwrap();

    let running = Running::start(broker, registry, ConsumerConfig::new(EXCHANGE)).await;
    running
        .publisher()
        .await
        .publish_event("user-signuped", &json!({"Email": "nope"}))
        .await
        .unwrap();

    let stats = wait_queue(&running.broker, "user-signuped", |s| s.nacked == 1).await;
    assert_eq!(stats.requeued, 0);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(running.broker.ready_messages("user-signuped.dead").len(), 1);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_unparseable_body_is_rejected_without_requeue() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = QueueRegistry::builder()
        .register("user-signuped", true, ok_handler(calls.clone()))
        .build()
        .unwrap();
    let running = Running::start(InMemoryBroker::new(), registry, ConsumerConfig::new(EXCHANGE)).await;

    let session = running.broker.connect().await.unwrap();
    session
        .publish(EXCHANGE, "user-signuped", OutboundMessage::new(b"{not json".to_vec()))
        .await
        .unwrap();

    let stats = wait_queue(&running.broker, "user-signuped", |s| s.nacked == 1).await;
    assert_eq!(stats.requeued, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_legacy_bare_payload_is_handled() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let registry = QueueRegistry::builder()
        .register(
            "user-signuped",
            true,
            handler_fn("capture", move |payload: Value| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(payload);
                    Ok(())
                }
            }),
        )
        .build()
        .unwrap();
    let running = Running::start(InMemoryBroker::new(), registry, ConsumerConfig::new(EXCHANGE)).await;

    let session = running.broker.connect().await.unwrap();
    session
        .publish(
            EXCHANGE,
            "user-signuped",
            OutboundMessage::new(br#"{"UserId":"legacy","Email":"old@example.com"}"#.to_vec()),
        )
        .await
        .unwrap();

    let payload = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(payload["UserId"], "legacy");
    wait_queue(&running.broker, "user-signuped", |s| s.acked == 1).await;

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_newer_envelope_version_is_rejected() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = QueueRegistry::builder()
        .register("user-signuped", true, ok_handler(calls.clone()))
        .build()
        .unwrap();
    let running = Running::start(InMemoryBroker::new(), registry, ConsumerConfig::new(EXCHANGE)).await;

    let body = json!({
        "version": 99,
        "id": uuid::Uuid::new_v4(),
        "event": "user-signuped",
        "published_at": "2026-01-01T00:00:00Z",
        "payload": {}
    });
    let session = running.broker.connect().await.unwrap();
    session
        .publish(EXCHANGE, "user-signuped", OutboundMessage::new(body.to_string().into_bytes()))
        .await
        .unwrap();

    let stats = wait_queue(&running.broker, "user-signuped", |s| s.nacked == 1).await;
    assert_eq!(stats.requeued, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_timeout_is_nacked_for_requeue() {
    let registry = QueueRegistry::builder()
        .register(
            "task-updated",
            true,
            handler_fn("slow", |_: Value| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .build()
        .unwrap();
    let config = ConsumerConfig::new(EXCHANGE)
        .with_handler_timeout(Duration::from_millis(50))
        .with_shutdown_grace(Duration::from_millis(100));
    let running = Running::start(InMemoryBroker::new(), registry, config).await;

    running
        .publisher()
        .await
        .publish_event("task-updated", &json!({"TaskId": "t-9"}))
        .await
        .unwrap();

    let stats = wait_queue(&running.broker, "task-updated", |s| s.requeued >= 1).await;
    assert_eq!(stats.acked, 0);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_panic_is_rejected_and_consumer_survives() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = QueueRegistry::builder()
        .register(
            "task-created",
            true,
            handler_fn("panics", explode),
        )
        .register("user-signuped", true, ok_handler(calls.clone()))
        .build()
        .unwrap();
    let running = Running::start(InMemoryBroker::new(), registry, ConsumerConfig::new(EXCHANGE)).await;
    let publisher = running.publisher().await;

    publisher.publish_event("task-created", &json!({})).await.unwrap();
    let stats = wait_queue(&running.broker, "task-created", |s| s.nacked == 1).await;
    assert_eq!(stats.requeued, 0);

    publisher.publish_event("user-signuped", &json!({})).await.unwrap();
    wait_queue(&running.broker, "user-signuped", |s| s.acked == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(running.consumer.state(), ConsumerState::Consuming);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_queue_is_rejected() {
    let broker = InMemoryBroker::new();
    let session = broker.connect().await.unwrap();
    session
        .declare_queue(&event_bus::transport::QueueSpec::new("orphan", true))
        .await
        .unwrap();
    session
        .publish("", "orphan", OutboundMessage::new(b"{}".to_vec()))
        .await
        .unwrap();
    let mut deliveries = session.consume("orphan", "test").await.unwrap();
    let delivery = deliveries.next().await.unwrap().unwrap();

    let registry = QueueRegistry::builder()
        .register("user-signuped", true, ok_handler(Arc::new(AtomicUsize::new(0))))
        .build()
        .unwrap();
    let outcome =
        EventConsumer::handle_delivery(&registry, &ConsumerConfig::default(), delivery).await;

    assert_eq!(outcome, DeliveryOutcome::Nacked { requeue: false });
    assert_eq!(broker.queue_stats("orphan").unwrap().nacked, 1);
}

#[tokio::test]
async fn test_consumer_retries_until_broker_available() {
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(3);
    let registry = QueueRegistry::builder()
        .register("user-signuped", true, ok_handler(Arc::new(AtomicUsize::new(0))))
        .build()
        .unwrap();

    let running = Running::start(broker, registry, ConsumerConfig::new(EXCHANGE)).await;

    assert_eq!(running.broker.connect_attempts(), 4);
    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_attempts_are_spaced_by_the_retry_interval() {
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(3);
    let registry = QueueRegistry::builder()
        .register("user-signuped", true, ok_handler(Arc::new(AtomicUsize::new(0))))
        .build()
        .unwrap();
    let consumer = Arc::new(EventConsumer::new(
        Arc::new(broker.clone()),
        Arc::new(registry),
        ConsumerConfig::new(EXCHANGE),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Supervisor::new(RetryPolicy::fixed(Duration::from_secs(2)));
    let mut states = consumer.subscribe_state();

    let start = tokio::time::Instant::now();
    let task = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run(&supervisor, shutdown_rx).await })
    };

    tokio::time::timeout(
        Duration::from_secs(60),
        states.wait_for(|s| *s == ConsumerState::Consuming),
    )
    .await
    .expect("consumer never reached Consuming")
    .unwrap();

    // Three failed attempts, each followed by one interval
    assert_eq!(start.elapsed(), Duration::from_secs(6));
    assert_eq!(broker.connect_attempts(), 4);
    assert_eq!(consumer.state(), ConsumerState::Consuming);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_default_publisher_retains_signups_until_consumer_starts() {
    let broker = InMemoryBroker::new();
    let publisher = EventPublisher::new(Arc::new(broker.clone()), PublisherConfig::default());
    publisher.connect().await.unwrap();

    publisher
        .publish_event(
            "user-signuped",
            &UserSignedUp {
                user_id: "u-early".into(),
                email: "early@example.com".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(broker.ready_messages("user-signuped").len(), 1);
    assert_eq!(broker.unroutable_count(), 0);

    let calls = Arc::new(AtomicUsize::new(0));
    let registry = QueueRegistry::builder()
        .register("user-signuped", true, ok_handler(calls.clone()))
        .build()
        .unwrap();
    let running = Running::start(broker, registry, ConsumerConfig::new(EXCHANGE)).await;

    wait_queue(&running.broker, "user-signuped", |s| s.acked == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    publisher.dispose().await;
    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_bounded_by_grace_when_all_slots_are_busy() {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let registry = QueueRegistry::builder()
        .register(
            "task-created",
            true,
            handler_fn("hangs", move |_: Value| {
                let started_tx = started_tx.clone();
                async move {
                    let _ = started_tx.send(());
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }),
        )
        .build()
        .unwrap();
    let config = ConsumerConfig::new(EXCHANGE)
        .with_max_concurrent_deliveries(1)
        .with_handler_timeout(Duration::from_secs(300))
        .with_shutdown_grace(Duration::from_secs(1));
    let running = Running::start(InMemoryBroker::new(), registry, config).await;

    let publisher = running.publisher().await;
    for i in 0..2 {
        publisher
            .publish_event("task-created", &json!({"TaskId": i}))
            .await
            .unwrap();
    }
    tokio::time::timeout(WAIT, started_rx.recv()).await.unwrap().unwrap();

    let broker = running.broker.clone();
    let start = tokio::time::Instant::now();
    running.stop().await.unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_secs(1), "stopped before grace: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "shutdown took {:?}", elapsed);

    // Neither message was settled, so both are back on the queue
    let stats = broker.queue_stats("task-created").unwrap();
    assert_eq!(stats.unacked, 0);
    assert_eq!(stats.acked, 0);
    assert_eq!(broker.ready_messages("task-created").len(), 2);
}

#[tokio::test]
async fn test_connection_loss_rearms_and_redelivers_unacked() {
    let release = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

    let registry = {
        let release = release.clone();
        let calls = calls.clone();
        QueueRegistry::builder()
            .register(
                "user-signuped",
                true,
                handler_fn("blocks-first", move |payload: Value| {
                    let release = release.clone();
                    let calls = calls.clone();
                    let seen_tx = seen_tx.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        let _ = seen_tx.send(payload);
                        if n == 0 {
                            // Hold the first delivery until the connection is gone
                            release.notified().await;
                        }
                        Ok(())
                    }
                }),
            )
            .build()
            .unwrap()
    };
    let running = Running::start(InMemoryBroker::new(), registry, ConsumerConfig::new(EXCHANGE)).await;

    running
        .publisher()
        .await
        .publish_event("user-signuped", &json!({"UserId": "u-7"}))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();

    running.broker.disconnect_all();
    release.notify_one();

    // The unacked delivery comes back after the consumer reconnects
    let redelivered = tokio::time::timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(redelivered["UserId"], "u-7");
    running.wait_for_state(ConsumerState::Consuming).await;

    let stats = wait_queue(&running.broker, "user-signuped", |s| s.acked == 1).await;
    assert_eq!(stats.requeued, 1);
    assert!(running.broker.connect_attempts() >= 3);

    // New messages keep flowing on the new connection
    running
        .publisher()
        .await
        .publish_event("user-signuped", &json!({"UserId": "u-8"}))
        .await
        .unwrap();
    wait_queue(&running.broker, "user-signuped", |s| s.acked == 2).await;

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_terminates_and_closes_connection() {
    let registry = QueueRegistry::builder()
        .register("user-signuped", true, ok_handler(Arc::new(AtomicUsize::new(0))))
        .build()
        .unwrap();
    let running = Running::start(InMemoryBroker::new(), registry, ConsumerConfig::new(EXCHANGE)).await;
    let broker = running.broker.clone();
    let consumer = running.consumer.clone();

    running.stop().await.unwrap();

    assert_eq!(consumer.state(), ConsumerState::Terminated);
    assert_eq!(broker.open_sessions(), 0);

    consumer.dispose().await;
    assert_eq!(consumer.state(), ConsumerState::Terminated);
}

#[tokio::test]
async fn test_shutdown_while_broker_unavailable() {
    let broker = InMemoryBroker::new();
    broker.set_unavailable(true);
    let registry = QueueRegistry::builder()
        .register("user-signuped", true, ok_handler(Arc::new(AtomicUsize::new(0))))
        .build()
        .unwrap();
    let consumer = Arc::new(EventConsumer::new(
        Arc::new(broker.clone()),
        Arc::new(registry),
        ConsumerConfig::new(EXCHANGE),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run(&Supervisor::default(), shutdown_rx).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();

    let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(consumer.state(), ConsumerState::Terminated);
}

#[tokio::test]
async fn test_bounded_retry_gives_up() {
    let broker = InMemoryBroker::new();
    broker.set_unavailable(true);
    let registry = QueueRegistry::builder()
        .register("user-signuped", true, ok_handler(Arc::new(AtomicUsize::new(0))))
        .build()
        .unwrap();
    let consumer = EventConsumer::new(
        Arc::new(broker.clone()),
        Arc::new(registry),
        ConsumerConfig::new(EXCHANGE),
    );
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor =
        Supervisor::new(RetryPolicy::fixed(Duration::from_millis(1)).with_max_attempts(2));

    let err = consumer.run(&supervisor, shutdown_rx).await.unwrap_err();

    assert!(matches!(err, EventBusError::RetryExhausted { attempts: 2, .. }));
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(consumer.state(), ConsumerState::Disconnected);
}

#[tokio::test]
async fn test_publish_serialization_failure_sends_nothing() {
    let broker = InMemoryBroker::new();
    let publisher = EventPublisher::new(
        Arc::new(broker.clone()),
        PublisherConfig::new(EXCHANGE),
    );
    publisher.connect().await.unwrap();

    let mut bad = std::collections::BTreeMap::new();
    bad.insert(vec![1u8], "non-string key");

    let err = publisher.publish_event("user-signuped", &bad).await.unwrap_err();

    assert!(matches!(err, EventBusError::Serialization(_)));
    assert_eq!(broker.published_count(), 0);
    assert!(broker.ready_messages("user-signuped").is_empty());
}

#[tokio::test]
async fn test_publisher_reconnects_with_supervisor() {
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(2);
    let publisher = EventPublisher::new(
        Arc::new(broker.clone()),
        PublisherConfig::new(EXCHANGE),
    );

    publisher
        .connect_with_retry(&Supervisor::new(RetryPolicy::fixed(Duration::from_millis(5))))
        .await
        .unwrap();

    assert_eq!(broker.connect_attempts(), 3);
    assert!(publisher.is_connected().await);

    // Retained until a consumer shows up
    publisher
        .publish_event("user-signuped", &json!({"UserId": "early"}))
        .await
        .unwrap();
    assert_eq!(broker.ready_messages("user-signuped").len(), 1);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let registry = {
        let active = active.clone();
        let peak = peak.clone();
        QueueRegistry::builder()
            .register(
                "task-created",
                true,
                handler_fn("tracks-concurrency", move |_: Value| {
                    let active = active.clone();
                    let peak = peak.clone();
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .build()
            .unwrap()
    };
    let config = ConsumerConfig::new(EXCHANGE)
        .with_prefetch(10)
        .with_max_concurrent_deliveries(2);
    let running = Running::start(InMemoryBroker::new(), registry, config).await;

    let publisher = running.publisher().await;
    for i in 0..6 {
        publisher
            .publish_event("task-created", &json!({"TaskId": i}))
            .await
            .unwrap();
    }

    wait_queue(&running.broker, "task-created", |s| s.acked == 6).await;
    assert!(peak.load(Ordering::SeqCst) <= 2);

    running.stop().await.unwrap();
}
