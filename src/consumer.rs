//! Per-queue consumer lifecycle: declare, consume, ack/nack deliveries, and
//! (for the recovering variant) redeclare after broker cancel or failover.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::channel_action;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::dispatch::{CommandDispatcher, InboundDispatcher};
use crate::errors::{BusError, Result};
use crate::topology::QueueSpec;
use crate::transport::{ConsumeOptions, ConsumerEvent, ConsumerStream, Delivery, ManagedChannel};
use crate::util::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Declared,
    Consuming,
    /// Recovering after a broker cancel or reconnect.
    Reconsuming,
    Cancelled,
    /// The channel/connection went away underneath the consumer.
    ModelShutdown,
    Disposed,
}

/// What the handler wants done with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Ack,
    Nack { requeue: bool },
    /// Ack, then cancel the subscription and dispose the consumer.
    Unsubscribe,
}

/// Handler errors are converted to a nack (no requeue) rather than being
/// allowed anywhere near the transport callback path.
pub type DeliveryHandler =
    Arc<dyn Fn(Delivery) -> BoxFuture<'static, anyhow::Result<HandlerOutcome>> + Send + Sync>;

pub fn delivery_handler<F, Fut>(handler: F) -> DeliveryHandler
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send + 'static,
{
    Arc::new(move |delivery| handler(delivery).boxed())
}

enum ConsumerControl {
    Unsubscribe,
}

struct ConsumerInner {
    queue: QueueSpec,
    requested_tag: String,
    tag: Mutex<String>,
    handler: DeliveryHandler,
    commands: Arc<CommandDispatcher>,
    /// Owned by this consumer. A slow handler here never delays the
    /// deliveries of any other consumer.
    inbound: Arc<InboundDispatcher>,
    connection: Arc<ConnectionManager>,
    options: ConsumeOptions,
    /// Persistent consumers survive broker cancels and reconnects;
    /// transient ones go straight to `Disposed`.
    recover: bool,
    state: Mutex<ConsumerState>,
    disposed: AtomicBool,
    control: mpsc::UnboundedSender<ConsumerControl>,
}

impl ConsumerInner {
    fn mark(&self, state: ConsumerState) {
        *lock(&self.state) = state;
    }

    /// Terminal teardown shared by every pump exit path.
    async fn finish(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.mark(ConsumerState::Disposed);
        self.inbound.dispose().await;
    }

    /// Declare the queue and start consuming, all through the command
    /// dispatcher so channel access stays single-writer. Returns the channel
    /// the subscription lives on together with its delivery stream.
    async fn open_stream(self: &Arc<Self>) -> Result<(Arc<dyn ManagedChannel>, ConsumerStream)> {
        type Opened = (Arc<dyn ManagedChannel>, ConsumerStream);
        let slot: Arc<Mutex<Option<Opened>>> = Arc::new(Mutex::new(None));
        let queue = self.queue.clone();
        let tag = self.requested_tag.clone();
        let options = self.options;
        let action_slot = slot.clone();
        self.commands
            .invoke(channel_action(move |channel| {
                let queue = queue.clone();
                let tag = tag.clone();
                let slot = action_slot.clone();
                async move {
                    let queue_name = channel.declare_queue(&queue).await?;
                    let stream = channel.basic_consume(&queue_name, &tag, options).await?;
                    *lock(&slot) = Some((channel, stream));
                    Ok(())
                }
            }))
            .await?;
        let (channel, stream) = lock(&slot)
            .take()
            .ok_or_else(|| BusError::Transport("consume completed without a stream".into()))?;
        // the broker may have assigned its own tag
        *lock(&self.tag) = stream.tag.clone();
        Ok((channel, stream))
    }

    async fn cancel_on_broker(&self) {
        let tag = lock(&self.tag).clone();
        if tag.is_empty() || !self.connection.is_connected() {
            return;
        }
        let result = self
            .commands
            .invoke(channel_action(move |channel| {
                let tag = tag.clone();
                async move { channel.basic_cancel(&tag).await }
            }))
            .await;
        if let Err(cancel_error) = result {
            // best effort: the broker forgets the consumer when the channel dies
            debug!(%cancel_error, "broker-side cancel failed");
        }
    }

    /// Hand one delivery to the inbound dispatcher: invoke the handler, map
    /// its outcome to an ack/nack, swallow transmission failures (the broker
    /// redelivers unacked messages once the connection drops).
    async fn dispatch_delivery(self: &Arc<Self>, channel: &Arc<dyn ManagedChannel>, delivery: Delivery) {
        let handler = self.handler.clone();
        let channel = channel.clone();
        let control = self.control.clone();
        let job = async move {
            let delivery_tag = delivery.delivery_tag;
            let outcome = match handler(delivery).await {
                Ok(outcome) => outcome,
                Err(handler_error) => {
                    error!(%handler_error, "delivery handler failed, nacking message");
                    HandlerOutcome::Nack { requeue: false }
                }
            };
            match outcome {
                HandlerOutcome::Ack => {
                    if let Err(ack_error) = channel.basic_ack(delivery_tag).await {
                        warn!(%ack_error, delivery_tag, "best-effort ack failed");
                    }
                }
                HandlerOutcome::Nack { requeue } => {
                    if let Err(nack_error) = channel.basic_nack(delivery_tag, requeue).await {
                        warn!(%nack_error, delivery_tag, "best-effort nack failed");
                    }
                }
                HandlerOutcome::Unsubscribe => {
                    if let Err(ack_error) = channel.basic_ack(delivery_tag).await {
                        warn!(%ack_error, delivery_tag, "best-effort ack failed");
                    }
                    let _ = control.send(ConsumerControl::Unsubscribe);
                }
            }
        };
        if let Err(enqueue_error) = self.inbound.invoke(job).await {
            debug!(%enqueue_error, "delivery dropped, inbound dispatcher unavailable");
        }
    }
}

/// A live subscription. Obtained from [`Consumer::start`] (or through
/// `MessageBus::consume`); disposed explicitly or by its own lifecycle.
pub struct Consumer {
    inner: Arc<ConsumerInner>,
    pump: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    pub async fn start(
        queue: QueueSpec,
        consumer_tag: String,
        handler: DeliveryHandler,
        commands: Arc<CommandDispatcher>,
        connection: Arc<ConnectionManager>,
        options: ConsumeOptions,
        recover: bool,
    ) -> Result<Arc<Self>> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let inbound = InboundDispatcher::start(&connection);
        let inner = Arc::new(ConsumerInner {
            queue,
            requested_tag: consumer_tag.clone(),
            tag: Mutex::new(consumer_tag),
            handler,
            commands,
            inbound,
            connection,
            options,
            recover,
            state: Mutex::new(ConsumerState::Declared),
            disposed: AtomicBool::new(false),
            control: control_tx,
        });

        let (channel, stream) = inner.open_stream().await?;
        inner.mark(ConsumerState::Consuming);
        info!(queue = %inner.queue.name, tag = %inner.tag(), "consumer started");

        let pump = tokio::spawn(Self::pump(inner.clone(), channel, stream, control_rx));
        Ok(Arc::new(Self {
            inner,
            pump: tokio::sync::Mutex::new(Some(pump)),
        }))
    }

    async fn pump(
        inner: Arc<ConsumerInner>,
        mut channel: Arc<dyn ManagedChannel>,
        mut stream: ConsumerStream,
        mut control: mpsc::UnboundedReceiver<ConsumerControl>,
    ) {
        let mut events = inner.connection.subscribe();
        let mut events_open = true;
        let mut stream_open = true;
        loop {
            tokio::select! {
                biased;
                Some(ConsumerControl::Unsubscribe) = control.recv() => {
                    debug!(tag = %inner.tag(), "unsubscribe requested by handler");
                    inner.mark(ConsumerState::Cancelled);
                    inner.cancel_on_broker().await;
                    inner.finish().await;
                    return;
                }
                event = events.recv(), if events_open => match event {
                    Ok(ConnectionEvent::Disconnected) => {
                        if inner.recover {
                            inner.mark(ConsumerState::ModelShutdown);
                        } else {
                            debug!(tag = %inner.tag(), "transient consumer lost its connection");
                            inner.finish().await;
                            return;
                        }
                    }
                    Ok(ConnectionEvent::Connected) => {
                        let down = matches!(
                            *lock(&inner.state),
                            ConsumerState::ModelShutdown | ConsumerState::Cancelled
                        );
                        if inner.recover && down {
                            inner.mark(ConsumerState::Reconsuming);
                            match inner.open_stream().await {
                                Ok((new_channel, new_stream)) => {
                                    info!(queue = %inner.queue.name, "consumer re-established after reconnect");
                                    channel = new_channel;
                                    stream = new_stream;
                                    stream_open = true;
                                    inner.mark(ConsumerState::Consuming);
                                }
                                Err(resubscribe_error) => {
                                    warn!(%resubscribe_error, "could not re-establish consumer");
                                    inner.finish().await;
                                    return;
                                }
                            }
                        }
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => {
                        events_open = false;
                    }
                },
                item = stream.events.recv(), if stream_open => match item {
                    Some(ConsumerEvent::Delivery(delivery)) => {
                        inner.dispatch_delivery(&channel, delivery).await;
                    }
                    Some(ConsumerEvent::Cancelled) | None => {
                        stream_open = false;
                        if !inner.connection.is_connected() {
                            // the disconnect handling above decides what happens
                            continue;
                        }
                        if inner.recover && !inner.disposed.load(Ordering::SeqCst) {
                            info!(queue = %inner.queue.name, "broker cancelled consumer, redeclaring");
                            inner.mark(ConsumerState::Reconsuming);
                            match inner.open_stream().await {
                                Ok((new_channel, new_stream)) => {
                                    channel = new_channel;
                                    stream = new_stream;
                                    stream_open = true;
                                    inner.mark(ConsumerState::Consuming);
                                }
                                Err(resubscribe_error) => {
                                    warn!(%resubscribe_error, "could not redeclare cancelled consumer");
                                    inner.finish().await;
                                    return;
                                }
                            }
                        } else {
                            inner.mark(ConsumerState::Cancelled);
                            inner.finish().await;
                            return;
                        }
                    }
                },
            }
        }
    }

    pub fn state(&self) -> ConsumerState {
        *lock(&self.inner.state)
    }

    pub fn tag(&self) -> String {
        self.inner.tag()
    }

    pub fn queue(&self) -> &QueueSpec {
        &self.inner.queue
    }

    /// Explicit cancel: broker-side `basic.cancel` (best effort), then local
    /// teardown including the consumer's delivery queue. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.mark(ConsumerState::Cancelled);
        self.inner.cancel_on_broker().await;
        let pump = self.pump.lock().await.take();
        if let Some(handle) = pump {
            handle.abort();
        }
        self.inner.inbound.dispose().await;
        self.inner.mark(ConsumerState::Disposed);
    }
}

impl ConsumerInner {
    fn tag(&self) -> String {
        lock(&self.tag).clone()
    }
}
