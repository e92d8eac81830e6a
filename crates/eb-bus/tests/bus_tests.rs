//! Message bus integration tests against the in-memory broker

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eb_bus::{BusError, ConnectionManager, Consumer, HandlerError, MemoryBroker, Publisher, SubscriptionState};
use eb_common::{routing_keys, ConnectionState, Envelope, ExchangeName};
use eb_config::BrokerConfig;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;

struct Harness {
    broker: MemoryBroker,
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    consumer: Consumer,
}

fn harness() -> Harness {
    let broker = MemoryBroker::new();
    let config = BrokerConfig {
        max_retries: 10,
        retry_delay: Duration::from_millis(10),
        ..Default::default()
    };
    let connection = Arc::new(ConnectionManager::new(Arc::new(broker.clone()), config));
    Harness {
        publisher: Publisher::new(Arc::clone(&connection), "auth-service"),
        consumer: Consumer::new(Arc::clone(&connection)),
        broker,
        connection,
    }
}

async fn eventually<F: Fn() -> bool>(check: F) {
    eventually_within(Duration::from_secs(5), check).await
}

async fn eventually_within<F: Fn() -> bool>(limit: Duration, check: F) {
    tokio::time::timeout(limit, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn recorder() -> (
    Arc<Mutex<Vec<Envelope>>>,
    impl Fn(Envelope) -> futures::future::Ready<Result<bool, HandlerError>> + Clone + Send + Sync + 'static,
) {
    let received: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let handler = move |envelope: Envelope| {
        sink.lock().push(envelope);
        futures::future::ready(Ok(true))
    };
    (received, handler)
}

#[tokio::test]
async fn test_user_registered_reaches_pattern_subscriber() {
    let h = harness();
    let (received, handler) = recorder();

    assert!(h.consumer.subscribe("auth-events", ExchangeName::Events, "user.*", handler).await);
    eventually(|| h.consumer.state("auth-events") == SubscriptionState::Receiving).await;

    let payload = json!({"event": "user.registered", "id": 42});
    assert!(h.publisher.publish(routing_keys::USER_REGISTERED, &payload, ExchangeName::Events).await);
    // Not matched by user.*
    assert!(h.publisher.publish_event(routing_keys::CONVERSATION_CREATED, &json!({"id": 1})).await);

    eventually(|| received.lock().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let received = received.lock();
    assert_eq!(received.len(), 1);
    let envelope = &received[0];
    assert_eq!(envelope.routing_key(), "user.registered");
    assert_eq!(envelope.metadata().origin_service(), "auth-service");
    assert_eq!(envelope.payload(), &payload);
    assert_eq!(h.broker.acked("auth-events"), 1);
    assert_eq!(h.broker.queue_depth("auth-events"), 0);
}

#[tokio::test]
async fn test_messages_arrive_in_publish_order() {
    let h = harness();
    let (received, handler) = recorder();
    assert!(h.consumer.subscribe("ordered", ExchangeName::Events, "message.sent", handler).await);

    for i in 0..20 {
        assert!(h.publisher.publish_event(routing_keys::MESSAGE_SENT, &json!({"seq": i})).await);
    }

    eventually(|| received.lock().len() == 20).await;
    let seqs: Vec<i64> = received
        .lock()
        .iter()
        .map(|e| e.payload()["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, (0..20).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_handler_false_requeues() {
    let h = harness();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let handler = move |_envelope: Envelope| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok::<bool, HandlerError>(attempt > 1) }
    };
    assert!(h.consumer.subscribe("retrying", ExchangeName::Events, "emotion.#", handler).await);
    assert!(h.publisher.publish_event(routing_keys::EMOTION_STATS_UPDATED, &json!({"mood": "calm"})).await);

    eventually(|| attempts.load(Ordering::SeqCst) == 2).await;
    eventually(|| h.broker.acked("retrying") == 1).await;
    assert_eq!(h.broker.requeued("retrying"), 1);
    assert_eq!(h.broker.rejected("retrying"), 0);
}

#[tokio::test]
async fn test_handler_error_drops_message() {
    let h = harness();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let handler = move |_envelope: Envelope| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Err::<bool, HandlerError>(HandlerError::new("bug in handler")) }
    };
    assert!(h.consumer.subscribe("failing", ExchangeName::Events, "user.login", handler).await);
    assert!(h.publisher.publish_event(routing_keys::USER_LOGIN, &json!({"id": 3})).await);

    eventually(|| h.broker.rejected("failing") == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(h.broker.queue_depth("failing"), 0);
}

#[tokio::test]
async fn test_handler_panic_drops_message_and_loop_survives() {
    let h = harness();
    let (received, _) = recorder();
    let sink = Arc::clone(&received);

    let handler = move |envelope: Envelope| {
        let sink = Arc::clone(&sink);
        async move {
            if envelope.payload()["explode"] == json!(true) {
                panic!("handler blew up");
            }
            sink.lock().push(envelope);
            Ok::<bool, HandlerError>(true)
        }
    };
    assert!(h.consumer.subscribe("panicky", ExchangeName::Events, "ai.#", handler).await);

    assert!(h.publisher.publish_event(routing_keys::AI_MODEL_UPDATED, &json!({"explode": true})).await);
    assert!(h.publisher.publish_event(routing_keys::AI_RESPONSE_GENERATED, &json!({"text": "hi"})).await);

    eventually(|| received.lock().len() == 1).await;
    assert_eq!(h.broker.rejected("panicky"), 1);
    assert_eq!(h.broker.acked("panicky"), 1);
    assert!(h.consumer.is_subscribed("panicky"));
}

#[tokio::test]
async fn test_poison_message_rejected_without_calling_handler() {
    let h = harness();
    let (received, handler) = recorder();
    assert!(h.consumer.subscribe("poisoned", ExchangeName::Events, "user.*", handler).await);

    assert!(h.broker.inject("poisoned", "user.registered", b"{not json".to_vec()));
    assert!(h.broker.inject("poisoned", "user.registered", br#"{"data":{}}"#.to_vec()));

    eventually(|| h.broker.rejected("poisoned") == 2).await;
    assert!(received.lock().is_empty());
    assert_eq!(h.broker.requeued("poisoned"), 0);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery_and_unbinds() {
    let h = harness();
    let (received, handler) = recorder();
    assert!(h.consumer.subscribe("leaving", ExchangeName::Events, "user.*", handler).await);
    assert_eq!(h.broker.bindings("events").len(), 1);

    h.consumer.unsubscribe("leaving").await;
    assert_eq!(h.consumer.state("leaving"), SubscriptionState::Idle);
    assert!(h.broker.bindings("events").is_empty());

    assert!(h.publisher.publish_event(routing_keys::USER_LOGOUT, &json!({"id": 9})).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(received.lock().is_empty());

    // Never subscribed, nothing to do
    h.consumer.unsubscribe("never-existed").await;
}

#[tokio::test]
async fn test_duplicate_subscription_rejected() {
    let h = harness();
    let (_, first) = recorder();
    let (_, second) = recorder();

    assert!(h.consumer.subscribe("dup", ExchangeName::Events, "user.*", first).await);
    assert!(!h.consumer.subscribe("dup", ExchangeName::Events, "message.*", second).await);
    assert_eq!(h.consumer.subscriptions(), vec!["dup".to_string()]);
}

#[tokio::test]
async fn test_fanout_reaches_every_queue() {
    let h = harness();
    let (left, left_handler) = recorder();
    let (right, right_handler) = recorder();

    assert!(h.consumer.subscribe("ws-notify", ExchangeName::Notifications, "", left_handler).await);
    assert!(h.consumer.subscribe("ai-notify", ExchangeName::Notifications, "ignored", right_handler).await);

    assert!(h.publisher.publish_notification(&json!({"title": "maintenance"})).await);

    eventually(|| left.lock().len() == 1 && right.lock().len() == 1).await;
    assert_eq!(left.lock()[0].payload()["title"], "maintenance");
}

#[tokio::test]
async fn test_direct_exchange_exact_match() {
    let h = harness();
    let (received, handler) = recorder();
    assert!(
        h.consumer
            .subscribe("analytics-sink", ExchangeName::Analytics, routing_keys::ANALYTICS_EVENT, handler)
            .await
    );

    assert!(h.publisher.publish_analytics("session_started", &json!({"user": 5})).await);
    assert!(h.publisher.publish("analytics.other", &json!({}), ExchangeName::Analytics).await);

    eventually(|| received.lock().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload()["event_type"], "session_started");
    assert_eq!(received[0].payload()["data"]["user"], 5);
}

#[tokio::test]
async fn test_consumer_resumes_after_broker_outage() {
    let h = harness();
    let (received, handler) = recorder();
    assert!(h.consumer.subscribe("resilient", ExchangeName::Events, "user.*", handler).await);

    h.broker.set_available(false);
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.broker.set_available(true);

    eventually(|| h.consumer.state("resilient") == SubscriptionState::Receiving && h.connection.is_connected())
        .await;
    assert!(h.publisher.publish_event(routing_keys::USER_REGISTERED, &json!({"id": 1})).await);

    eventually(|| received.lock().len() == 1).await;
}

#[tokio::test]
async fn test_shutdown_stops_all_loops() {
    let h = harness();
    let (_, a) = recorder();
    let (_, b) = recorder();
    assert!(h.consumer.subscribe("a", ExchangeName::Events, "user.*", a).await);
    assert!(h.consumer.subscribe("b", ExchangeName::Events, "message.*", b).await);

    h.consumer.shutdown().await;
    assert!(h.consumer.subscriptions().is_empty());

    h.connection.close().await;
    assert_eq!(h.connection.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_broker_down_exhausts_retries_then_publish_is_false() {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let config = BrokerConfig::default();
    let connection = Arc::new(ConnectionManager::new(Arc::new(broker.clone()), config));

    let started = tokio::time::Instant::now();
    let err = connection.ensure_connected().await.err().unwrap();
    assert!(matches!(err, BusError::Connection(_)));
    assert_eq!(broker.connect_attempts(), 5);
    assert_eq!(started.elapsed(), Duration::from_secs(20));

    let publisher = Publisher::new(Arc::clone(&connection), "auth-service");
    assert!(!publisher.publish_event(routing_keys::USER_LOGIN, &json!({"id": 1})).await);
    assert_eq!(connection.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn test_payload_key_order_survives_the_bus() {
    let h = harness();
    let (received, handler) = recorder();
    assert!(h.consumer.subscribe("ordered-keys", ExchangeName::Events, "user.*", handler).await);

    let original = r#"{"zeta":1,"alpha":2,"mid":{"y":true,"b":null}}"#;
    let payload: serde_json::Value = serde_json::from_str(original).unwrap();
    assert!(h.publisher.publish_event(routing_keys::USER_REGISTERED, &payload).await);

    eventually(|| received.lock().len() == 1).await;
    let body = serde_json::to_string(received.lock()[0].payload()).unwrap();
    assert_eq!(body, original);
}

#[tokio::test]
async fn test_concurrent_subscribe_keeps_one_consumer() {
    let h = harness();
    let (left, left_handler) = recorder();
    let (right, right_handler) = recorder();

    let (a, b) = tokio::join!(
        h.consumer.subscribe("contested", ExchangeName::Events, "user.*", left_handler),
        h.consumer.subscribe("contested", ExchangeName::Events, "user.*", right_handler),
    );
    assert!(a ^ b);
    assert_eq!(h.consumer.subscriptions(), vec!["contested".to_string()]);

    for i in 0..3 {
        assert!(h.publisher.publish_event(routing_keys::USER_LOGIN, &json!({"id": i})).await);
    }
    eventually(|| left.lock().len() + right.lock().len() == 3).await;
    assert!(left.lock().is_empty() || right.lock().is_empty());
    assert_eq!(h.broker.acked("contested"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_outlives_connection_retry_budget() {
    let broker = MemoryBroker::new();
    let connection = Arc::new(ConnectionManager::new(Arc::new(broker.clone()), BrokerConfig::default()));
    let publisher = Publisher::new(Arc::clone(&connection), "auth-service");
    let consumer = Consumer::new(Arc::clone(&connection));
    let (received, handler) = recorder();

    assert!(consumer.subscribe("patient", ExchangeName::Events, "user.*", handler).await);

    // Several full connection budgets (5 attempts, 5s apart) go by
    broker.set_available(false);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(consumer.is_subscribed("patient"));
    assert_eq!(consumer.state("patient"), SubscriptionState::Subscribed);
    assert!(broker.connect_attempts() > 5);

    broker.set_available(true);
    eventually_within(Duration::from_secs(60), || {
        consumer.state("patient") == SubscriptionState::Receiving
    })
    .await;

    assert!(publisher.publish_event(routing_keys::USER_REGISTERED, &json!({"id": 7})).await);
    eventually(|| received.lock().len() == 1).await;
}

#[tokio::test]
async fn test_unsubscribe_returns_prefetched_messages() {
    let h = harness();
    h.broker.set_prefetch(true);

    let handled = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&handled);
    let handler = move |_envelope: Envelope| {
        let counter = Arc::clone(&counter);
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<bool, HandlerError>(true)
        }
    };
    assert!(h.consumer.subscribe("prefetching", ExchangeName::Events, "message.sent", handler).await);

    for i in 0..5 {
        assert!(h.publisher.publish_event(routing_keys::MESSAGE_SENT, &json!({"seq": i})).await);
    }
    eventually(|| handled.load(Ordering::SeqCst) >= 1).await;

    h.consumer.unsubscribe("prefetching").await;

    let acked = h.broker.acked("prefetching");
    let waiting = h.broker.queue_depth("prefetching") as u64;
    assert_eq!(acked, handled.load(Ordering::SeqCst) as u64);
    assert_eq!(acked + waiting, 5);
    assert!(waiting > 0);
    assert!(h.broker.requeued("prefetching") > 0);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_with_retry_waits_for_broker() {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let connection = Arc::new(ConnectionManager::new(Arc::new(broker.clone()), BrokerConfig::default()));
    let publisher = Publisher::new(Arc::clone(&connection), "auth-service");
    let consumer = Consumer::new(Arc::clone(&connection));
    let (received, handler) = recorder();
    let (_shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

    let outage = async {
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(!consumer.is_subscribed("late-events"));
        broker.set_available(true);
    };
    let (subscribed, ()) = tokio::join!(
        consumer.subscribe_with_retry("late-events", ExchangeName::Events, "#", handler, &mut shutdown_rx),
        outage,
    );

    assert!(subscribed);
    assert!(consumer.is_subscribed("late-events"));
    assert!(publisher.publish_event(routing_keys::USER_LOGIN, &json!({"id": 2})).await);
    eventually(|| received.lock().len() == 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_with_retry_stops_on_shutdown() {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let connection = Arc::new(ConnectionManager::new(Arc::new(broker.clone()), BrokerConfig::default()));
    let consumer = Consumer::new(Arc::clone(&connection));
    let (_, handler) = recorder();
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

    let stop = async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown_tx.send(()).unwrap();
    };
    let (subscribed, ()) = tokio::join!(
        consumer.subscribe_with_retry("never", ExchangeName::Events, "#", handler, &mut shutdown_rx),
        stop,
    );

    assert!(!subscribed);
    assert!(!consumer.is_subscribed("never"));
    assert!(broker.connect_attempts() >= 5);
}
