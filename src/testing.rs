//! In-memory transport fakes. They implement the transport traits over plain
//! collections so the recovery, dispatch and confirm machinery can be driven
//! deterministically without a broker: tests flip connectivity, inject
//! failures and emit confirm frames by hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{BusError, Result};
use crate::topology::{ExchangeSpec, QueueSpec};
use crate::transport::{
    ConfirmCallback, ConfirmEvent, ConsumeOptions, ConsumerEvent, ConsumerStream, Delivery,
    ManagedChannel, ManagedConnection, PublishArgs, ShutdownCallback, Transport,
};
use crate::util::lock;

/// Transport whose first `fail_first` connect attempts are refused. Every
/// successful connect yields a fresh [`FakeConnection`] the test can reach
/// through [`FakeTransport::last_connection`].
pub struct FakeTransport {
    fail_first: AtomicUsize,
    attempts: AtomicUsize,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Self::failing_first(0)
    }

    pub fn failing_first(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_first: AtomicUsize::new(fail_first),
            attempts: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Refuse every connect attempt from now on.
    pub fn refuse_connects(&self) {
        self.fail_first.store(usize::MAX, Ordering::SeqCst);
    }

    /// Accept connect attempts again.
    pub fn allow_connects(&self) {
        self.fail_first.store(0, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        lock(&self.connections).last().cloned()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> Result<Arc<dyn ManagedConnection>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first.load(Ordering::SeqCst) {
            return Err(BusError::Transport("connection refused".into()));
        }
        let connection = FakeConnection::new();
        lock(&self.connections).push(connection.clone());
        Ok(connection)
    }
}

/// One fake broker connection. `trigger_shutdown` simulates the broker (or
/// the network) killing it: channels close, delivery streams end, shutdown
/// observers fire.
pub struct FakeConnection {
    connected: AtomicBool,
    fail_next_channels: AtomicUsize,
    /// Shared with every channel; survives channel replacement.
    fail_all_publishes: Arc<AtomicBool>,
    shutdown_callbacks: Mutex<Vec<ShutdownCallback>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            fail_next_channels: AtomicUsize::new(0),
            fail_all_publishes: Arc::new(AtomicBool::new(false)),
            shutdown_callbacks: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
        })
    }

    /// Fail every publish on every channel of this connection, including
    /// channels opened later, until switched off again.
    pub fn fail_publishes(&self, enabled: bool) {
        self.fail_all_publishes.store(enabled, Ordering::SeqCst);
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }

    pub fn last_channel(&self) -> Option<Arc<FakeChannel>> {
        lock(&self.channels).last().cloned()
    }

    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        lock(&self.channels).clone()
    }

    /// Refuse the next `count` `create_channel` calls.
    pub fn fail_next_channels(&self, count: usize) {
        self.fail_next_channels.store(count, Ordering::SeqCst);
    }

    /// Involuntary shutdown: mark the connection dead, close every channel
    /// and notify the registered shutdown observers.
    pub fn trigger_shutdown(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let channels = lock(&self.channels).clone();
            for channel in channels {
                channel.force_close();
            }
            let callbacks = std::mem::take(&mut *lock(&self.shutdown_callbacks));
            for callback in callbacks {
                callback(reason.to_string());
            }
        }
    }
}

#[async_trait]
impl ManagedConnection for FakeConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn ManagedChannel>> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let remaining = self.fail_next_channels.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_channels.store(remaining - 1, Ordering::SeqCst);
            return Err(BusError::ChannelClosed("injected channel failure".into()));
        }
        let channel = FakeChannel::new(self.fail_all_publishes.clone());
        lock(&self.channels).push(channel.clone());
        Ok(channel)
    }

    fn on_shutdown(&self, callback: ShutdownCallback) {
        if self.is_connected() {
            lock(&self.shutdown_callbacks).push(callback);
        } else {
            callback("already closed".to_string());
        }
    }

    async fn close(&self) -> Result<()> {
        // voluntary close: no shutdown observers
        self.connected.store(false, Ordering::SeqCst);
        let channels = lock(&self.channels).clone();
        for channel in channels {
            channel.force_close();
        }
        Ok(())
    }
}

/// One fake channel: records everything done to it and lets the test emit
/// confirm frames, deliveries and broker-side cancels.
pub struct FakeChannel {
    open: AtomicBool,
    /// Next publish sequence number, starting at 1 as AMQP does.
    sequence: AtomicU64,
    sequence_reads: AtomicUsize,
    delivery_tags: AtomicU64,
    server_names: AtomicU64,
    fail_next_publishes: AtomicUsize,
    fail_all_publishes: Arc<AtomicBool>,
    confirms_selected: AtomicBool,
    confirm_observers: Mutex<Vec<ConfirmCallback>>,
    consumers: Mutex<HashMap<String, mpsc::UnboundedSender<ConsumerEvent>>>,
    /// Declarations, binds and consumes in call order, e.g.
    /// `queue.declare orders` or `queue.bind orders orders-exchange`.
    operations: Mutex<Vec<String>>,
    published: Mutex<Vec<(u64, PublishArgs)>>,
    declared_queues: Mutex<Vec<QueueSpec>>,
    declared_exchanges: Mutex<Vec<ExchangeSpec>>,
    bindings: Mutex<Vec<(String, String, String)>>,
    acks: Mutex<Vec<u64>>,
    nacks: Mutex<Vec<(u64, bool)>>,
    cancelled_tags: Mutex<Vec<String>>,
    prefetch: AtomicUsize,
}

impl FakeChannel {
    fn new(fail_all_publishes: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            sequence: AtomicU64::new(1),
            sequence_reads: AtomicUsize::new(0),
            delivery_tags: AtomicU64::new(1),
            server_names: AtomicU64::new(0),
            fail_next_publishes: AtomicUsize::new(0),
            fail_all_publishes,
            confirms_selected: AtomicBool::new(false),
            confirm_observers: Mutex::new(Vec::new()),
            consumers: Mutex::new(HashMap::new()),
            operations: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            declared_queues: Mutex::new(Vec::new()),
            declared_exchanges: Mutex::new(Vec::new()),
            bindings: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            nacks: Mutex::new(Vec::new()),
            cancelled_tags: Mutex::new(Vec::new()),
            prefetch: AtomicUsize::new(0),
        })
    }

    fn force_close(&self) {
        self.open.store(false, Ordering::SeqCst);
        // dropping the senders ends every delivery stream
        lock(&self.consumers).clear();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::ChannelClosed("fake channel closed".into()))
        }
    }

    /// Pin the next publish sequence number.
    pub fn set_next_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::SeqCst);
    }

    /// How many times `next_publish_seq_no` was read. A republish reads the
    /// counter again, so the count exposes retry activity.
    pub fn sequence_reads(&self) -> usize {
        self.sequence_reads.load(Ordering::SeqCst)
    }

    /// Fail the next `count` publishes with a recoverable channel error.
    pub fn fail_next_publishes(&self, count: usize) {
        self.fail_next_publishes.store(count, Ordering::SeqCst);
    }

    /// Everything published on this channel, with the sequence number each
    /// publish consumed.
    pub fn published(&self) -> Vec<(u64, PublishArgs)> {
        lock(&self.published).clone()
    }

    pub fn published_bodies(&self) -> Vec<Vec<u8>> {
        lock(&self.published)
            .iter()
            .map(|(_, args)| args.body.clone())
            .collect()
    }

    pub fn operations(&self) -> Vec<String> {
        lock(&self.operations).clone()
    }

    fn record_op(&self, op: String) {
        lock(&self.operations).push(op);
    }

    pub fn declared_queues(&self) -> Vec<QueueSpec> {
        lock(&self.declared_queues).clone()
    }

    pub fn declared_queue_names(&self) -> Vec<String> {
        lock(&self.declared_queues)
            .iter()
            .map(|q| q.name.clone())
            .collect()
    }

    pub fn declared_exchange_names(&self) -> Vec<String> {
        lock(&self.declared_exchanges)
            .iter()
            .map(|x| x.name.clone())
            .collect()
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        lock(&self.bindings).clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        lock(&self.acks).clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool)> {
        lock(&self.nacks).clone()
    }

    pub fn cancelled_tags(&self) -> Vec<String> {
        lock(&self.cancelled_tags).clone()
    }

    pub fn prefetch(&self) -> usize {
        self.prefetch.load(Ordering::SeqCst)
    }

    pub fn confirms_selected(&self) -> bool {
        self.confirms_selected.load(Ordering::SeqCst)
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        lock(&self.consumers).keys().cloned().collect()
    }

    fn emit(&self, event: ConfirmEvent) {
        let observers = lock(&self.confirm_observers).clone();
        for observer in observers {
            observer(event);
        }
    }

    /// Emit a broker ack confirm frame.
    pub fn confirm_ack(&self, sequence: u64, multiple: bool) {
        self.emit(ConfirmEvent::Ack { sequence, multiple });
    }

    /// Emit a broker nack confirm frame.
    pub fn confirm_nack(&self, sequence: u64, multiple: bool) {
        self.emit(ConfirmEvent::Nack { sequence, multiple });
    }

    /// Push a delivery into a consumer's stream. Returns false when no
    /// consumer with that tag exists (or its stream already ended).
    pub fn deliver(&self, consumer_tag: &str, body: Vec<u8>) -> bool {
        let delivery_tag = self.delivery_tags.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            consumer_tag: consumer_tag.to_string(),
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties: Default::default(),
            body,
        };
        lock(&self.consumers)
            .get(consumer_tag)
            .map(|sender| sender.send(ConsumerEvent::Delivery(delivery)).is_ok())
            .unwrap_or(false)
    }

    /// Broker-initiated cancel: emits `Cancelled` and ends the stream.
    pub fn server_cancel(&self, consumer_tag: &str) {
        if let Some(sender) = lock(&self.consumers).remove(consumer_tag) {
            let _ = sender.send(ConsumerEvent::Cancelled);
        }
    }
}

#[async_trait]
impl ManagedChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn confirm_select(&self) -> Result<()> {
        self.ensure_open()?;
        self.confirms_selected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn next_publish_seq_no(&self) -> u64 {
        self.sequence_reads.fetch_add(1, Ordering::SeqCst);
        self.sequence.load(Ordering::SeqCst)
    }

    fn on_confirm(&self, callback: ConfirmCallback) {
        lock(&self.confirm_observers).push(callback);
    }

    async fn basic_publish(&self, args: &PublishArgs) -> Result<()> {
        self.ensure_open()?;
        if self.fail_all_publishes.load(Ordering::SeqCst) {
            return Err(BusError::ChannelClosed("injected publish failure".into()));
        }
        let remaining = self.fail_next_publishes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_publishes.store(remaining - 1, Ordering::SeqCst);
            return Err(BusError::ChannelClosed("injected publish failure".into()));
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        lock(&self.published).push((sequence, args.clone()));
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch.store(prefetch_count as usize, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<String> {
        self.ensure_open()?;
        lock(&self.declared_queues).push(queue.clone());
        let name = if queue.name.is_empty() {
            let n = self.server_names.fetch_add(1, Ordering::SeqCst);
            format!("amq.gen-{n}")
        } else {
            queue.name.clone()
        };
        self.record_op(format!("queue.declare {name}"));
        Ok(name)
    }

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.ensure_open()?;
        lock(&self.declared_exchanges).push(exchange.clone());
        self.record_op(format!("exchange.declare {}", exchange.name));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        lock(&self.bindings).push((
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ));
        self.record_op(format!("queue.bind {queue} {exchange}"));
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _options: ConsumeOptions,
    ) -> Result<ConsumerStream> {
        self.ensure_open()?;
        let tag = if consumer_tag.is_empty() {
            let n = self.server_names.fetch_add(1, Ordering::SeqCst);
            format!("amq.ctag-{n}")
        } else {
            consumer_tag.to_string()
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        lock(&self.consumers).insert(tag.clone(), events_tx);
        self.record_op(format!("basic.consume {queue}"));
        Ok(ConsumerStream {
            tag,
            events: events_rx,
        })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;
        lock(&self.acks).push(delivery_tag);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        lock(&self.nacks).push((delivery_tag, requeue));
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;
        lock(&self.cancelled_tags).push(consumer_tag.to_string());
        lock(&self.consumers).remove(consumer_tag);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.force_close();
        Ok(())
    }
}
