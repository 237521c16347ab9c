//! Consumer lifecycle: outcome-to-ack mapping, handler failure handling,
//! unsubscribe, and recovery of persistent consumers after broker cancels
//! and connection loss.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burrow::testing::{FakeChannel, FakeTransport};
use burrow::{
    delivery_handler, CommandDispatcher, ConnectionManager, Consumer, ConsumerState,
    DeliveryHandler, HandlerOutcome, QueueSpec,
};
use burrow::transport::ConsumeOptions;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct Harness {
    transport: Arc<FakeTransport>,
    manager: Arc<ConnectionManager>,
    commands: Arc<CommandDispatcher>,
}

impl Harness {
    async fn start() -> Self {
        let transport = FakeTransport::new();
        let manager = ConnectionManager::start(transport.clone(), Duration::from_millis(30));
        manager
            .wait_connected(Duration::from_secs(1))
            .await
            .expect("connects");
        let commands = CommandDispatcher::start(manager.clone(), Duration::from_secs(2), Vec::new());
        Self {
            transport,
            manager,
            commands,
        }
    }

    async fn consumer(&self, handler: DeliveryHandler, recover: bool) -> Arc<Consumer> {
        self.consumer_tagged("tag-1", handler, recover).await
    }

    async fn consumer_tagged(
        &self,
        tag: &str,
        handler: DeliveryHandler,
        recover: bool,
    ) -> Arc<Consumer> {
        Consumer::start(
            QueueSpec::new("orders").expect("valid queue"),
            tag.to_string(),
            handler,
            self.commands.clone(),
            self.manager.clone(),
            ConsumeOptions::default(),
            recover,
        )
        .await
        .expect("consumer starts")
    }

    fn channel(&self) -> Arc<FakeChannel> {
        self.transport
            .last_connection()
            .expect("connection exists")
            .last_channel()
            .expect("channel exists")
    }

    async fn teardown(self) {
        self.commands.dispose().await;
        self.manager.dispose().await;
    }
}

#[tokio::test]
async fn successful_handler_acks_the_delivery() {
    init_tracing();
    let harness = Harness::start().await;
    let consumer = harness
        .consumer(delivery_handler(|_delivery| async { Ok(HandlerOutcome::Ack) }), false)
        .await;
    assert_eq!(consumer.state(), ConsumerState::Consuming);

    let channel = harness.channel();
    assert!(channel.deliver("tag-1", b"payload".to_vec()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(channel.acks(), vec![1]);
    assert!(channel.nacks().is_empty());
    consumer.dispose().await;
    harness.teardown().await;
}

#[tokio::test]
async fn nack_outcome_carries_the_requeue_flag() {
    init_tracing();
    let harness = Harness::start().await;
    let consumer = harness
        .consumer(
            delivery_handler(|_delivery| async { Ok(HandlerOutcome::Nack { requeue: true }) }),
            false,
        )
        .await;

    let channel = harness.channel();
    assert!(channel.deliver("tag-1", b"try later".to_vec()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(channel.nacks(), vec![(1, true)]);
    assert!(channel.acks().is_empty());
    consumer.dispose().await;
    harness.teardown().await;
}

#[tokio::test]
async fn handler_error_nacks_without_requeue() {
    init_tracing();
    let harness = Harness::start().await;
    let consumer = harness
        .consumer(
            delivery_handler(|_delivery| async { anyhow::bail!("business rule violated") }),
            false,
        )
        .await;

    let channel = harness.channel();
    assert!(channel.deliver("tag-1", b"poison".to_vec()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(channel.nacks(), vec![(1, false)]);
    assert!(channel.acks().is_empty());
    consumer.dispose().await;
    harness.teardown().await;
}

#[tokio::test]
async fn unsubscribe_outcome_acks_cancels_and_disposes() {
    init_tracing();
    let harness = Harness::start().await;
    let consumer = harness
        .consumer(
            delivery_handler(|_delivery| async { Ok(HandlerOutcome::Unsubscribe) }),
            true,
        )
        .await;

    let channel = harness.channel();
    assert!(channel.deliver("tag-1", b"last one".to_vec()));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(channel.acks(), vec![1]);
    assert_eq!(channel.cancelled_tags(), vec!["tag-1".to_string()]);
    assert_eq!(consumer.state(), ConsumerState::Disposed);
    // the broker no longer knows the tag, so deliveries go nowhere
    assert!(!channel.deliver("tag-1", b"too late".to_vec()));
    harness.teardown().await;
}

#[tokio::test]
async fn deliveries_are_handled_in_order() {
    init_tracing();
    let harness = Harness::start().await;
    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_seen = seen.clone();
    let handler_calls = calls.clone();
    let consumer = harness
        .consumer(
            delivery_handler(move |delivery| {
                let seen = handler_seen.clone();
                let calls = handler_calls.clone();
                async move {
                    // the first delivery is the slowest; order must still hold
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_millis(80)).await;
                    }
                    seen.lock().unwrap().push(delivery.body);
                    Ok(HandlerOutcome::Ack)
                }
            }),
            false,
        )
        .await;

    let channel = harness.channel();
    assert!(channel.deliver("tag-1", b"1".to_vec()));
    assert!(channel.deliver("tag-1", b"2".to_vec()));
    assert!(channel.deliver("tag-1", b"3".to_vec()));
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]
    );
    assert_eq!(channel.acks(), vec![1, 2, 3]);
    consumer.dispose().await;
    harness.teardown().await;
}

#[tokio::test]
async fn slow_handler_does_not_block_a_sibling_consumer() {
    init_tracing();
    let harness = Harness::start().await;
    let slow = harness
        .consumer_tagged(
            "tag-slow",
            delivery_handler(|_delivery| async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok(HandlerOutcome::Ack)
            }),
            false,
        )
        .await;
    let sibling_handled = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let handler_flag = sibling_handled.clone();
    let fast = harness
        .consumer_tagged(
            "tag-fast",
            delivery_handler(move |_delivery| {
                let flag = handler_flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(HandlerOutcome::Ack)
                }
            }),
            false,
        )
        .await;

    let channel = harness.channel();
    assert!(channel.deliver("tag-slow", b"takes a while".to_vec()));
    assert!(channel.deliver("tag-fast", b"quick".to_vec()));
    tokio::time::sleep(Duration::from_millis(150)).await;

    // the slow handler is still sleeping; the sibling already finished
    assert!(sibling_handled.load(Ordering::SeqCst));
    assert_eq!(channel.acks(), vec![2]);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let mut acks = channel.acks();
    acks.sort_unstable();
    assert_eq!(acks, vec![1, 2]);

    slow.dispose().await;
    fast.dispose().await;
    harness.teardown().await;
}

#[tokio::test]
async fn persistent_consumer_redeclares_after_broker_cancel() {
    init_tracing();
    let harness = Harness::start().await;
    let consumer = harness
        .consumer(delivery_handler(|_delivery| async { Ok(HandlerOutcome::Ack) }), true)
        .await;

    let channel = harness.channel();
    assert_eq!(channel.declared_queue_names(), vec!["orders".to_string()]);

    channel.server_cancel("tag-1");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(consumer.state(), ConsumerState::Consuming);
    assert_eq!(
        channel.declared_queue_names(),
        vec!["orders".to_string(), "orders".to_string()]
    );
    assert!(channel.deliver("tag-1", b"after cancel".to_vec()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(channel.acks(), vec![1]);

    consumer.dispose().await;
    harness.teardown().await;
}

#[tokio::test]
async fn persistent_consumer_survives_a_reconnect() {
    init_tracing();
    let harness = Harness::start().await;
    let consumer = harness
        .consumer(delivery_handler(|_delivery| async { Ok(HandlerOutcome::Ack) }), true)
        .await;

    harness
        .transport
        .last_connection()
        .expect("connection exists")
        .trigger_shutdown("failover");
    harness
        .manager
        .wait_connected(Duration::from_secs(2))
        .await
        .expect("reconnects");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(consumer.state(), ConsumerState::Consuming);
    let channel = harness.channel();
    assert!(channel.deliver("tag-1", b"after reconnect".to_vec()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(channel.acks(), vec![1]);

    consumer.dispose().await;
    harness.teardown().await;
}

#[tokio::test]
async fn transient_consumer_dies_with_its_connection() {
    init_tracing();
    let harness = Harness::start().await;
    let consumer = harness
        .consumer(delivery_handler(|_delivery| async { Ok(HandlerOutcome::Ack) }), false)
        .await;
    assert_eq!(consumer.state(), ConsumerState::Consuming);

    harness
        .transport
        .last_connection()
        .expect("connection exists")
        .trigger_shutdown("failover");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(consumer.state(), ConsumerState::Disposed);
    harness.teardown().await;
}

#[tokio::test]
async fn dispose_cancels_on_the_broker_and_is_idempotent() {
    init_tracing();
    let harness = Harness::start().await;
    let consumer = harness
        .consumer(delivery_handler(|_delivery| async { Ok(HandlerOutcome::Ack) }), true)
        .await;

    consumer.dispose().await;
    consumer.dispose().await;

    assert_eq!(consumer.state(), ConsumerState::Disposed);
    let channel = harness.channel();
    assert_eq!(channel.cancelled_tags(), vec!["tag-1".to_string()]);
    harness.teardown().await;
}
