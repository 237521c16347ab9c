//! End-to-end bus assembly over the fake transport: channel hooks, confirmed
//! and fire-and-forget publishing, convention-based subscriptions and
//! ordered teardown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use burrow::testing::FakeTransport;
use burrow::{BrokerConfig, BusError, ManagedConnection, MessageBus};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct OrderPlaced {
    order_id: String,
    total_cents: u64,
}

fn test_config(confirms: bool) -> BrokerConfig {
    BrokerConfig {
        publisher_confirms: confirms,
        timeout_ms: 2_000,
        reconnect_ms: 30,
        ..BrokerConfig::default()
    }
}

async fn connected_bus(confirms: bool) -> (Arc<FakeTransport>, Arc<MessageBus>) {
    let transport = FakeTransport::new();
    let bus = MessageBus::start(test_config(confirms), transport.clone())
        .await
        .expect("bus assembles");
    bus.wait_connected(Duration::from_secs(1))
        .await
        .expect("connects");
    (transport, bus)
}

#[tokio::test]
async fn confirmed_publish_resolves_on_broker_ack() {
    init_tracing();
    let (transport, bus) = connected_bus(true).await;

    let publish_bus = bus.clone();
    let publish = tokio::spawn(async move {
        let order = OrderPlaced {
            order_id: "o-1".into(),
            total_cents: 1299,
        };
        publish_bus.publish("orders", "placed", &order).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let channel = transport
        .last_connection()
        .expect("connection exists")
        .last_channel()
        .expect("publish channel");
    // the command channel hooks ran: prefetch applied, confirm mode on
    assert!(channel.confirms_selected());
    assert_eq!(channel.prefetch(), 50);

    let published = channel.published();
    assert_eq!(published.len(), 1);
    let (sequence, args) = &published[0];
    assert_eq!(args.exchange, "orders");
    assert_eq!(args.routing_key, "placed");
    assert_eq!(args.properties.content_type.as_deref(), Some("application/json"));
    assert!(args.properties.persistent);
    let body: OrderPlaced = serde_json::from_slice(&args.body).expect("json body");
    assert_eq!(body.order_id, "o-1");

    channel.confirm_ack(*sequence, false);
    timeout(Duration::from_secs(1), publish)
        .await
        .expect("resolves")
        .expect("task completes")
        .expect("ack means success");
    bus.dispose().await;
}

#[tokio::test]
async fn fire_and_forget_publish_skips_confirm_mode() {
    init_tracing();
    let (transport, bus) = connected_bus(false).await;

    let order = OrderPlaced {
        order_id: "o-2".into(),
        total_cents: 50,
    };
    bus.publish("orders", "placed", &order)
        .await
        .expect("enqueues without waiting for a confirm");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let channel = transport
        .last_connection()
        .expect("connection exists")
        .last_channel()
        .expect("outbound channel");
    assert!(!channel.confirms_selected());
    assert_eq!(channel.published().len(), 1);
    bus.dispose().await;
}

#[tokio::test]
async fn subscribe_declares_the_full_topology_and_consumes() {
    init_tracing();
    let (transport, bus) = connected_bus(true).await;

    let received: Arc<Mutex<Vec<OrderPlaced>>> = Arc::new(Mutex::new(Vec::new()));
    let handler_received = received.clone();
    let consumer = bus
        .subscribe::<OrderPlaced, _, _>("billing", move |order| {
            let received = handler_received.clone();
            async move {
                received.lock().unwrap().push(order);
                Ok(())
            }
        })
        .await
        .expect("subscription starts");

    let channel = transport
        .last_connection()
        .expect("connection exists")
        .last_channel()
        .expect("command channel");
    assert_eq!(
        channel.declared_exchange_names(),
        vec!["OrderPlaced".to_string(), "OrderPlaced.dlx".to_string()]
    );
    let queues = channel.declared_queue_names();
    assert!(queues.contains(&"OrderPlaced.billing.dlq".to_string()));
    assert!(queues.contains(&"OrderPlaced.billing".to_string()));
    let bindings = channel.bindings();
    assert!(bindings.contains(&(
        "OrderPlaced.billing.dlq".to_string(),
        "OrderPlaced.dlx".to_string(),
        String::new()
    )));
    assert!(bindings.contains(&(
        "OrderPlaced.billing".to_string(),
        "OrderPlaced".to_string(),
        String::new()
    )));
    // the subscription queue dead-letters into the dlx
    let subscription_queue = channel
        .declared_queues()
        .into_iter()
        .find(|q| q.name == "OrderPlaced.billing")
        .expect("subscription queue declared");
    assert!(subscription_queue
        .arguments
        .contains(&("x-dead-letter-exchange".to_string(), "OrderPlaced.dlx".to_string())));

    let order = OrderPlaced {
        order_id: "o-3".into(),
        total_cents: 700,
    };
    let body = serde_json::to_vec(&order).expect("serializes");
    assert!(channel.deliver(&consumer.tag(), body));
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(*received.lock().unwrap(), vec![order]);
    assert_eq!(channel.acks(), vec![1]);
    bus.dispose().await;
}

#[tokio::test]
async fn subscription_queues_are_declared_before_they_are_bound() {
    init_tracing();
    let (transport, bus) = connected_bus(true).await;
    bus.subscribe::<OrderPlaced, _, _>("billing", |_order| async { Ok(()) })
        .await
        .expect("subscription starts");

    let channel = transport
        .last_connection()
        .expect("connection exists")
        .last_channel()
        .expect("command channel");
    let ops = channel.operations();
    let position = |op: &str| {
        ops.iter()
            .position(|recorded| recorded == op)
            .unwrap_or_else(|| panic!("missing operation {op:?} in {ops:?}"))
    };

    // a real broker closes the channel on a bind against an undeclared queue
    assert!(
        position("queue.declare OrderPlaced.billing")
            < position("queue.bind OrderPlaced.billing OrderPlaced")
    );
    assert!(
        position("queue.declare OrderPlaced.billing.dlq")
            < position("queue.bind OrderPlaced.billing.dlq OrderPlaced.dlx")
    );
    bus.dispose().await;
}

#[tokio::test]
async fn malformed_payload_goes_to_the_dead_letter_queue() {
    init_tracing();
    let (transport, bus) = connected_bus(true).await;

    let consumer = bus
        .subscribe::<OrderPlaced, _, _>("billing", |_order| async { Ok(()) })
        .await
        .expect("subscription starts");

    let channel = transport
        .last_connection()
        .expect("connection exists")
        .last_channel()
        .expect("command channel");
    assert!(channel.deliver(&consumer.tag(), b"definitely not json".to_vec()));
    tokio::time::sleep(Duration::from_millis(150)).await;

    // nack without requeue; broker-side dead-lettering does the rest
    assert_eq!(channel.nacks(), vec![(1, false)]);
    assert!(channel.acks().is_empty());
    bus.dispose().await;
}

#[tokio::test]
async fn subscribe_rejects_an_empty_subscription_id() {
    init_tracing();
    let (_transport, bus) = connected_bus(true).await;
    let result = bus
        .subscribe::<OrderPlaced, _, _>("", |_order| async { Ok(()) })
        .await;
    assert!(matches!(result, Err(BusError::InvalidArgument(_))));
    bus.dispose().await;
}

#[tokio::test]
async fn convention_publish_declares_the_exchange_once() {
    init_tracing();
    let (transport, bus) = connected_bus(false).await;

    let order = OrderPlaced {
        order_id: "o-4".into(),
        total_cents: 10,
    };
    bus.publish_message(&order).await.expect("publishes");
    bus.publish_message(&order).await.expect("publishes again");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let connection = transport.last_connection().expect("connection exists");
    let channels = connection.channels();
    // declaration goes through the command channel, delivery through outbound
    let declared: Vec<String> = channels
        .iter()
        .flat_map(|c| c.declared_exchange_names())
        .collect();
    assert_eq!(declared, vec!["OrderPlaced".to_string()]);
    let published: usize = channels.iter().map(|c| c.published().len()).sum();
    assert_eq!(published, 2);
    bus.dispose().await;
}

#[tokio::test]
async fn dispose_is_ordered_and_terminal() {
    init_tracing();
    let (transport, bus) = connected_bus(true).await;
    let consumer = bus
        .subscribe::<OrderPlaced, _, _>("billing", |_order| async { Ok(()) })
        .await
        .expect("subscription starts");

    bus.dispose().await;
    bus.dispose().await;

    assert_eq!(consumer.state(), burrow::ConsumerState::Disposed);
    assert!(!transport
        .last_connection()
        .expect("connection exists")
        .is_connected());
    let order = OrderPlaced {
        order_id: "o-5".into(),
        total_cents: 1,
    };
    assert!(matches!(
        bus.publish("orders", "placed", &order).await,
        Err(BusError::Disposed(_))
    ));
}
