//! End-to-end tests of the pub/sub engine against the in-memory broker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use peril_broker::{
    Broker, BrokerChannel, BrokerError, Delivery, ExchangeKind, MemoryBroker, MemoryConnection,
    OutboundMessage, QueueFlags,
};
use peril_codec::{Codec, JsonCodec};
use peril_pubsub::{
    AckType, AsyncHandler, DecodeFailurePolicy, DurabilityPolicy, Handler, PubSub, PubSubConfig,
    PubSubError, SetupStep, SubscriptionState, publish, publish_bincode, publish_json,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

const DIRECT: &str = "peril_direct";
const TOPIC: &str = "peril_topic";
const DLQ: &str = "peril_dlq";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ArmyMove {
    player: String,
    destination: String,
}

fn army_move() -> ArmyMove {
    ArmyMove {
        player: "alice".into(),
        destination: "gaul".into(),
    }
}

// =========================================================================
// Helpers
// =========================================================================

async fn engine_with(config: PubSubConfig) -> (MemoryBroker, PubSub<MemoryConnection>) {
    let broker = MemoryBroker::new();
    let pubsub = PubSub::new(Arc::new(broker.connect()), config);
    pubsub
        .declare_topology(&[(DIRECT, ExchangeKind::Direct), (TOPIC, ExchangeKind::Topic)])
        .await
        .unwrap();
    (broker, pubsub)
}

async fn engine() -> (MemoryBroker, PubSub<MemoryConnection>) {
    engine_with(PubSubConfig::default()).await
}

/// Forwards every message to a test receiver and answers a fixed ack.
struct Forward<T> {
    tx: mpsc::UnboundedSender<T>,
    ack: AckType,
}

impl<T: Send + 'static> Handler<T> for Forward<T> {
    async fn handle(&self, message: T) -> AckType {
        let _ = self.tx.send(message);
        self.ack
    }
}

fn forward<T: Send + 'static>(ack: AckType) -> (Forward<T>, mpsc::UnboundedReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Forward { tx, ack }, rx)
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("handler dropped")
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

async fn publish_raw(pubsub: &PubSub<MemoryConnection>, exchange: &str, key: &str, body: &[u8]) {
    let channel = pubsub.broker().open_channel().await.unwrap();
    channel
        .publish(
            exchange,
            key,
            OutboundMessage {
                body,
                content_type: "application/json",
            },
        )
        .await
        .unwrap();
    channel.close().await.unwrap();
}

// =========================================================================
// Queue binder
// =========================================================================

#[tokio::test]
async fn test_declare_and_bind_is_idempotent() {
    let (broker, pubsub) = engine().await;

    for _ in 0..2 {
        let (channel, bound) = pubsub
            .declare_and_bind(TOPIC, "army_moves", "army_moves.*", DurabilityPolicy::Durable)
            .await
            .unwrap();
        assert_eq!(bound.name, "army_moves");
        assert_eq!(bound.policy, DurabilityPolicy::Durable);
        channel.close().await.unwrap();
    }

    assert_eq!(
        broker.bindings(TOPIC),
        vec![("army_moves".to_string(), "army_moves.*".to_string())]
    );
}

#[tokio::test]
async fn test_declared_queue_carries_policy_flags_and_dead_letter() {
    let (broker, pubsub) = engine().await;

    let (_channel, bound) = pubsub
        .declare_and_bind(DIRECT, "pause.alice", "pause", DurabilityPolicy::Transient)
        .await
        .unwrap();

    assert_eq!(
        broker.queue_flags(&bound.name),
        Some(QueueFlags {
            durable: false,
            auto_delete: true,
            exclusive: true,
        })
    );
    let args = broker.queue_arguments(&bound.name).unwrap();
    assert_eq!(args.dead_letter_exchange.as_deref(), Some("peril_dlx"));
}

#[tokio::test]
async fn test_declare_and_bind_names_the_failed_step() {
    let (_broker, pubsub) = engine().await;

    let (_channel, _) = pubsub
        .declare_and_bind(DIRECT, "shared", "shared", DurabilityPolicy::Durable)
        .await
        .unwrap();
    let err = pubsub
        .declare_and_bind(DIRECT, "shared", "shared", DurabilityPolicy::Transient)
        .await
        .unwrap_err();
    assert_eq!(err.setup_step(), Some(SetupStep::DeclareQueue));

    let err = pubsub
        .declare_and_bind("no_such_exchange", "orphan", "key", DurabilityPolicy::Durable)
        .await
        .unwrap_err();
    assert_eq!(err.setup_step(), Some(SetupStep::BindQueue));
    assert!(err.to_string().starts_with("couldn't bind queue:"), "{err}");

    pubsub.broker().close().await.unwrap();
    let err = pubsub
        .declare_and_bind(DIRECT, "late", "late", DurabilityPolicy::Durable)
        .await
        .unwrap_err();
    assert_eq!(err.setup_step(), Some(SetupStep::OpenChannel));
}

#[tokio::test]
async fn test_transient_queue_is_exclusive_to_its_connection() {
    let (broker, pubsub) = engine().await;
    let (_channel, _) = pubsub
        .declare_and_bind(DIRECT, "pause.alice", "pause", DurabilityPolicy::Transient)
        .await
        .unwrap();

    let other = PubSub::new(Arc::new(broker.connect()), PubSubConfig::default());
    let err = other
        .declare_and_bind(DIRECT, "pause.alice", "pause", DurabilityPolicy::Transient)
        .await
        .unwrap_err();
    assert_eq!(err.setup_step(), Some(SetupStep::DeclareQueue));
    assert!(matches!(
        err,
        PubSubError::Connection {
            source: BrokerError::ResourceLocked(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_declare_topology_is_idempotent() {
    let (broker, pubsub) = engine().await;

    pubsub
        .declare_topology(&[(DIRECT, ExchangeKind::Direct), (TOPIC, ExchangeKind::Topic)])
        .await
        .unwrap();

    assert_eq!(
        broker.bindings("peril_dlx"),
        vec![(DLQ.to_string(), String::new())]
    );
    assert_eq!(
        broker.queue_flags(DLQ),
        Some(QueueFlags {
            durable: true,
            ..QueueFlags::default()
        })
    );

    let err = pubsub
        .declare_topology(&[(DIRECT, ExchangeKind::Fanout)])
        .await
        .unwrap_err();
    assert_eq!(err.setup_step(), Some(SetupStep::DeclareExchange));
}

// =========================================================================
// Delivery loop
// =========================================================================

#[tokio::test]
async fn test_army_move_reaches_wildcard_subscriber() {
    let (broker, pubsub) = engine().await;
    let (handler, mut rx) = forward::<ArmyMove>(AckType::Ack);

    let subscription = pubsub
        .subscribe_json(TOPIC, "army_moves", "army_moves.*", DurabilityPolicy::Durable, handler)
        .await
        .unwrap();
    assert_eq!(subscription.queue(), "army_moves");

    let publisher = pubsub.publisher(JsonCodec).await.unwrap();
    publisher
        .publish(TOPIC, "army_moves.alice", &army_move())
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, army_move());
    eventually("ack", || subscription.stats().acked == 1).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err(), "delivered more than once");
    let stats = broker.queue_stats("army_moves").unwrap();
    assert_eq!((stats.ready, stats.unacked), (0, 0));
    assert_eq!(subscription.state(), SubscriptionState::Running);
}

#[tokio::test]
async fn test_requeued_message_is_redelivered() {
    let (broker, pubsub) = engine().await;
    let calls = AtomicUsize::new(0);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = move |message: ArmyMove| {
        let _ = tx.send(message);
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            AckType::NackRequeue
        } else {
            AckType::Ack
        }
    };

    let subscription = pubsub
        .subscribe_json(TOPIC, "army_moves", "army_moves.*", DurabilityPolicy::Durable, handler)
        .await
        .unwrap();
    let channel = pubsub.broker().open_channel().await.unwrap();
    publish_json(&channel, TOPIC, "army_moves.alice", &army_move())
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, army_move());
    assert_eq!(recv(&mut rx).await, army_move());
    eventually("requeue then ack", || {
        let stats = subscription.stats();
        stats.requeued == 1 && stats.acked == 1
    })
    .await;
    assert_eq!(subscription.stats().delivered, 2);
    assert_eq!(broker.queue_stats("army_moves").unwrap().unacked, 0);
}

#[tokio::test]
async fn test_discarded_message_lands_on_dead_letter_queue() {
    let (broker, pubsub) = engine().await;
    let (handler, mut rx) = forward::<ArmyMove>(AckType::NackDiscard);

    let subscription = pubsub
        .subscribe_json(TOPIC, "army_moves", "army_moves.*", DurabilityPolicy::Durable, handler)
        .await
        .unwrap();
    let channel = pubsub.broker().open_channel().await.unwrap();
    publish_json(&channel, TOPIC, "army_moves.alice", &army_move())
        .await
        .unwrap();

    recv(&mut rx).await;
    eventually("discard", || subscription.stats().discarded == 1).await;

    let expected = JsonCodec.encode(&army_move()).unwrap();
    assert_eq!(broker.ready_messages(DLQ), vec![expected]);
    let stats = broker.queue_stats("army_moves").unwrap();
    assert_eq!((stats.ready, stats.unacked), (0, 0));
}

#[tokio::test]
async fn test_undecodable_message_is_left_unsettled_under_leave() {
    let config = PubSubConfig {
        decode_failure: DecodeFailurePolicy::Leave,
        ..PubSubConfig::default()
    };
    let (broker, pubsub) = engine_with(config).await;
    let (handler, mut rx) = forward::<ArmyMove>(AckType::Ack);

    let subscription = pubsub
        .subscribe_json(TOPIC, "army_moves", "army_moves.*", DurabilityPolicy::Durable, handler)
        .await
        .unwrap();
    publish_raw(&pubsub, TOPIC, "army_moves.alice", b"{not json").await;

    eventually("decode failure", || subscription.stats().decode_failures == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(rx.try_recv().is_err(), "handler ran on an undecodable body");
    let stats = subscription.stats();
    assert_eq!((stats.acked, stats.requeued, stats.discarded), (0, 0, 0));
    assert_eq!(broker.queue_stats("army_moves").unwrap().unacked, 1);
    assert!(broker.ready_messages(DLQ).is_empty());
}

#[tokio::test]
async fn test_undecodable_message_is_discarded_by_default() {
    let (broker, pubsub) = engine().await;
    let (handler, mut rx) = forward::<ArmyMove>(AckType::Ack);

    let subscription = pubsub
        .subscribe_json(TOPIC, "army_moves", "army_moves.*", DurabilityPolicy::Durable, handler)
        .await
        .unwrap();
    publish_raw(&pubsub, TOPIC, "army_moves.alice", b"{not json").await;
    let channel = pubsub.broker().open_channel().await.unwrap();
    publish_json(&channel, TOPIC, "army_moves.alice", &army_move())
        .await
        .unwrap();

    // The loop keeps going after the bad delivery.
    assert_eq!(recv(&mut rx).await, army_move());
    eventually("discard and ack", || {
        let stats = subscription.stats();
        stats.discarded == 1 && stats.acked == 1
    })
    .await;
    assert_eq!(subscription.stats().decode_failures, 1);
    assert_eq!(broker.ready_messages(DLQ), vec![b"{not json".to_vec()]);
    assert_eq!(broker.queue_stats("army_moves").unwrap().unacked, 0);
}

#[tokio::test]
async fn test_prefetch_bounds_unacked_deliveries() {
    let config = PubSubConfig {
        prefetch_count: 3,
        ..PubSubConfig::default()
    };
    let (broker, pubsub) = engine_with(config).await;
    let handler = AsyncHandler(|_: u32| std::future::pending::<AckType>());

    let subscription = pubsub
        .subscribe_json(DIRECT, "stuck", "stuck", DurabilityPolicy::Durable, handler)
        .await
        .unwrap();
    let channel = pubsub.broker().open_channel().await.unwrap();
    for n in 0..10u32 {
        publish_json(&channel, DIRECT, "stuck", &n).await.unwrap();
    }

    eventually("first delivery", || subscription.stats().delivered == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = broker.queue_stats("stuck").unwrap();
    assert_eq!(stats.unacked, 3);
    assert_eq!(stats.ready, 7);
    assert_eq!(subscription.stats().delivered, 1);
}

#[tokio::test]
async fn test_deliveries_are_handled_in_order_one_at_a_time() {
    let (_broker, pubsub) = engine().await;
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handler = {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        AsyncHandler(move |n: u32| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let tx = tx.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(n);
                AckType::Ack
            }
        })
    };

    let subscription = pubsub
        .subscribe_json(DIRECT, "ordered", "ordered", DurabilityPolicy::Durable, handler)
        .await
        .unwrap();
    let channel = pubsub.broker().open_channel().await.unwrap();
    for n in 0..20u32 {
        publish_json(&channel, DIRECT, "ordered", &n).await.unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..20 {
        seen.push(recv(&mut rx).await);
    }
    assert_eq!(seen, (0..20).collect::<Vec<_>>());
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    eventually("all acked", || subscription.stats().acked == 20).await;
}

#[tokio::test]
async fn test_ack_failure_is_logged_and_loop_ends_with_stream() {
    let broker = MemoryBroker::new();
    let publisher_side = PubSub::new(Arc::new(broker.connect()), PubSubConfig::default());
    publisher_side
        .declare_topology(&[(TOPIC, ExchangeKind::Topic)])
        .await
        .unwrap();

    let connection = broker.connect();
    let pubsub = PubSub::new(Arc::new(connection.clone()), PubSubConfig::default());
    let handler = AsyncHandler(move |_: ArmyMove| {
        let connection = connection.clone();
        async move {
            // Closing the connection under the loop makes the ack fail.
            let _ = connection.close().await;
            AckType::Ack
        }
    });

    let subscription = pubsub
        .subscribe_json(TOPIC, "army_moves", "army_moves.*", DurabilityPolicy::Durable, handler)
        .await
        .unwrap();
    let channel = publisher_side.broker().open_channel().await.unwrap();
    publish_json(&channel, TOPIC, "army_moves.alice", &army_move())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), subscription.stopped())
        .await
        .expect("subscription didn't stop");
    let stats = subscription.stats();
    assert_eq!(stats.ack_failures, 1);
    assert_eq!(stats.acked, 0);
    assert_eq!(subscription.state(), SubscriptionState::Stopped);

    // The unsettled delivery went back to the durable queue.
    let queue = broker.queue_stats("army_moves").unwrap();
    assert_eq!((queue.ready, queue.unacked), (1, 0));
}

#[tokio::test]
async fn test_subscription_stops_when_connection_closes() {
    let (broker, pubsub) = engine().await;
    let (handler, _rx) = forward::<bool>(AckType::Ack);

    let subscription = pubsub
        .subscribe_json(DIRECT, "pause.alice", "pause", DurabilityPolicy::Transient, handler)
        .await
        .unwrap();
    eventually("running", || subscription.state() == SubscriptionState::Running).await;
    assert_eq!(broker.queue_stats("pause.alice").unwrap().consumers, 1);

    pubsub.broker().close().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), subscription.stopped())
        .await
        .expect("subscription didn't stop");

    assert_eq!(subscription.state(), SubscriptionState::Stopped);
    assert!(broker.queue_stats("pause.alice").is_none(), "transient queue survived");
}

#[tokio::test]
async fn test_subscriptions_run_independently() {
    let (_broker, pubsub) = engine().await;
    let stuck = AsyncHandler(|_: bool| std::future::pending::<AckType>());
    let (handler, mut rx) = forward::<bool>(AckType::Ack);

    let alice = pubsub
        .subscribe_json(DIRECT, "pause.alice", "pause", DurabilityPolicy::Transient, stuck)
        .await
        .unwrap();
    let bob = pubsub
        .subscribe_json(DIRECT, "pause.bob", "pause", DurabilityPolicy::Transient, handler)
        .await
        .unwrap();

    let channel = pubsub.broker().open_channel().await.unwrap();
    publish_json(&channel, DIRECT, "pause", &true).await.unwrap();
    publish_json(&channel, DIRECT, "pause", &false).await.unwrap();

    assert!(recv(&mut rx).await);
    assert!(!recv(&mut rx).await);
    eventually("bob acked both", || bob.stats().acked == 2).await;
    eventually("alice stuck on the first", || alice.stats().delivered == 1).await;
    assert_eq!(alice.stats().acked, 0);
}

#[tokio::test]
async fn test_bincode_subscription() {
    let (broker, pubsub) = engine().await;
    let (handler, mut rx) = forward::<ArmyMove>(AckType::Ack);

    let subscription = pubsub
        .subscribe_bincode(TOPIC, "game_logs", "game_logs.*", DurabilityPolicy::Durable, handler)
        .await
        .unwrap();
    let channel = pubsub.broker().open_channel().await.unwrap();
    publish_bincode(&channel, TOPIC, "game_logs.alice", &army_move())
        .await
        .unwrap();
    // A JSON body is not valid bincode for this type.
    publish_json(&channel, TOPIC, "game_logs.alice", &army_move())
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, army_move());
    eventually("bad body discarded", || subscription.stats().decode_failures == 1).await;
    assert_eq!(subscription.stats().acked, 1);
    assert_eq!(broker.ready_messages(DLQ).len(), 1);
}

// =========================================================================
// Publisher
// =========================================================================

#[tokio::test]
async fn test_publisher_tags_content_type() {
    let (_broker, pubsub) = engine().await;
    let (channel, bound) = pubsub
        .declare_and_bind(DIRECT, "inspect", "inspect", DurabilityPolicy::Durable)
        .await
        .unwrap();
    let mut stream = channel.consume(&bound.name, "inspector").await.unwrap();

    let publisher = pubsub.publisher(JsonCodec).await.unwrap();
    publisher.publish(DIRECT, "inspect", &army_move()).await.unwrap();
    publisher.close().await.unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delivery.content_type(), "application/json");
    assert_eq!(delivery.routing_key(), "inspect");
    let decoded: ArmyMove = JsonCodec.decode(delivery.body()).unwrap();
    assert_eq!(decoded, army_move());
    delivery.ack().await.unwrap();
}

#[tokio::test]
async fn test_encode_failure_is_reported_before_publishing() {
    let (_broker, pubsub) = engine().await;
    let channel = pubsub.broker().open_channel().await.unwrap();
    channel.close().await.unwrap();

    // JSON object keys must be strings.
    let mut value = BTreeMap::new();
    value.insert(vec![1u8, 2], 3u8);

    let err = publish(&channel, &JsonCodec, DIRECT, "pause", &value)
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::Encode(_)), "{err:?}");
}

#[tokio::test]
async fn test_publish_failures_are_returned() {
    let (_broker, pubsub) = engine().await;
    let channel = pubsub.broker().open_channel().await.unwrap();

    let err = publish_json(&channel, "no_such_exchange", "pause", &true)
        .await
        .unwrap_err();
    assert!(
        matches!(
            &err,
            PubSubError::Publish {
                source: BrokerError::NotFound { .. },
                ..
            }
        ),
        "{err:?}"
    );

    channel.close().await.unwrap();
    let err = publish_json(&channel, DIRECT, "pause", &true)
        .await
        .unwrap_err();
    match err {
        PubSubError::Publish {
            exchange,
            routing_key,
            source: BrokerError::ChannelClosed,
        } => {
            assert_eq!(exchange, DIRECT);
            assert_eq!(routing_key, "pause");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_publisher_on_closed_connection_fails_setup() {
    let (_broker, pubsub) = engine().await;
    pubsub.broker().close().await.unwrap();

    let err = pubsub.publisher(JsonCodec).await.err().unwrap();
    assert_eq!(err.setup_step(), Some(SetupStep::OpenChannel));
}
