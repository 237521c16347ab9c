//! Connection manager behavior against the in-memory transport: retry until
//! the broker is reachable, reconnect after involuntary shutdown, terminal
//! disposal.

use std::time::Duration;

use burrow::testing::FakeTransport;
use burrow::{BusError, ConnectionEvent, ConnectionManager, ManagedConnection};
use tokio::sync::broadcast;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn next_event(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    within: Duration,
) -> ConnectionEvent {
    timeout(within, events.recv())
        .await
        .expect("event within deadline")
        .expect("event channel open")
}

#[tokio::test]
async fn retries_until_broker_is_reachable() {
    init_tracing();
    let transport = FakeTransport::failing_first(2);
    let manager = ConnectionManager::start(transport.clone(), Duration::from_millis(30));

    manager
        .wait_connected(Duration::from_secs(2))
        .await
        .expect("connects after two refusals");

    assert!(manager.is_connected());
    assert!(transport.connect_attempts() >= 3);
    assert_eq!(transport.connection_count(), 1);
    manager.dispose().await;
}

#[tokio::test]
async fn reconnects_after_involuntary_shutdown() {
    init_tracing();
    let transport = FakeTransport::new();
    let manager = ConnectionManager::start(transport.clone(), Duration::from_millis(30));
    manager
        .wait_connected(Duration::from_secs(1))
        .await
        .expect("initial connect");

    let mut events = manager.subscribe();
    let first = transport.last_connection().expect("connection exists");
    first.trigger_shutdown("heartbeat missed");

    assert_eq!(
        next_event(&mut events, Duration::from_secs(1)).await,
        ConnectionEvent::Disconnected
    );
    assert_eq!(
        next_event(&mut events, Duration::from_secs(1)).await,
        ConnectionEvent::Connected
    );
    assert_eq!(transport.connection_count(), 2);
    assert!(manager.is_connected());
    manager.dispose().await;
}

#[tokio::test]
async fn create_channel_fails_fast_while_disconnected() {
    init_tracing();
    let transport = FakeTransport::new();
    let manager = ConnectionManager::start(transport.clone(), Duration::from_millis(30));
    manager
        .wait_connected(Duration::from_secs(1))
        .await
        .expect("initial connect");

    transport.refuse_connects();
    transport
        .last_connection()
        .expect("connection exists")
        .trigger_shutdown("network partition");

    let mut events = manager.subscribe();
    // wait for the manager to observe the loss before asserting
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!manager.is_connected());
    assert!(matches!(
        manager.create_channel().await,
        Err(BusError::NotConnected)
    ));

    transport.allow_connects();
    loop {
        match next_event(&mut events, Duration::from_secs(2)).await {
            ConnectionEvent::Connected => break,
            ConnectionEvent::Disconnected => continue,
        }
    }
    assert!(manager.create_channel().await.is_ok());
    manager.dispose().await;
}

#[tokio::test]
async fn wait_connected_times_out_when_broker_stays_down() {
    init_tracing();
    let transport = FakeTransport::failing_first(usize::MAX);
    let manager = ConnectionManager::start(transport, Duration::from_millis(20));

    let result = manager.wait_connected(Duration::from_millis(150)).await;
    assert!(matches!(result, Err(BusError::Timeout(_))));
    manager.dispose().await;
}

#[tokio::test]
async fn dispose_is_terminal_and_idempotent() {
    init_tracing();
    let transport = FakeTransport::new();
    let manager = ConnectionManager::start(transport.clone(), Duration::from_millis(30));
    manager
        .wait_connected(Duration::from_secs(1))
        .await
        .expect("initial connect");
    let connection = transport.last_connection().expect("connection exists");

    manager.dispose().await;
    manager.dispose().await;

    assert!(!manager.is_connected());
    assert!(!connection.is_connected());
    assert!(matches!(
        manager.create_channel().await,
        Err(BusError::Disposed(_))
    ));

    // the supervisor is gone, so no reconnect happens either
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.connection_count(), 1);
}
