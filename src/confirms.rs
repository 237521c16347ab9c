//! Publisher-confirm tracking: maps broker sequence numbers to pending
//! publishes, resolves them on ack/nack, republishes on per-message timeout
//! and replays everything still pending after a reconnect.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{channel_action, ChannelAction};
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::dispatch::CommandDispatcher;
use crate::errors::{BusError, Result};
use crate::transport::ConfirmEvent;
use crate::util::lock;

/// One logical publish awaiting broker confirmation.
///
/// `sequence_ids` holds every sequence number this publish was ever assigned,
/// oldest first; a timeout-triggered republish appends a new id to the same
/// entry rather than creating a new one, so a late ack for an old id still
/// resolves the one outstanding future exactly once.
struct PendingPublish {
    /// Submission index; replay after reconnect goes in ascending order.
    order: u64,
    action: ChannelAction,
    sequence_ids: Mutex<Vec<u64>>,
    completion: Mutex<Option<oneshot::Sender<Result<()>>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PendingPublish {
    fn is_pending(&self) -> bool {
        lock(&self.completion).is_some()
    }

    fn resolve(&self, result: Result<()>) {
        self.stop_timer();
        if let Some(sender) = lock(&self.completion).take() {
            let _ = sender.send(result);
        }
    }

    fn stop_timer(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
    }
}

struct Inner {
    executor: Arc<CommandDispatcher>,
    connection: Arc<ConnectionManager>,
    timeout: Duration,
    /// Every sequence id a pending publish has ever used maps to its entry.
    entries: Mutex<BTreeMap<u64, Arc<PendingPublish>>>,
    next_order: AtomicU64,
    /// Held across "read sequence counter + record entry + raw publish" so
    /// sequence assignment can never interleave between two publishes.
    publish_gate: tokio::sync::Mutex<()>,
}

impl Inner {
    /// Publish (or republish) one entry. The wrapped action reads the
    /// channel's next sequence number and records the mapping before the raw
    /// publish goes out, so a confirm can never arrive for an unknown id.
    async fn publish_entry(inner: &Arc<Inner>, entry: Arc<PendingPublish>) -> Result<()> {
        let _gate = inner.publish_gate.lock().await;
        let raw_action = entry.action.clone();
        let record_inner = inner.clone();
        let record_entry = entry.clone();
        let wrapped = channel_action(move |channel| {
            let raw_action = raw_action.clone();
            let inner = record_inner.clone();
            let entry = record_entry.clone();
            async move {
                let sequence = channel.next_publish_seq_no();
                {
                    lock(&inner.entries).insert(sequence, entry.clone());
                    lock(&entry.sequence_ids).push(sequence);
                }
                raw_action(channel).await
            }
        });
        let result = inner.executor.invoke(wrapped).await;
        if result.is_ok() {
            Inner::arm_timer(inner, entry);
        }
        result
    }

    /// Per-entry retry timer. On fire while connected the entry is
    /// republished in place; while disconnected nothing happens because the
    /// reconnect flow replays pending entries anyway.
    fn arm_timer(inner: &Arc<Inner>, entry: Arc<PendingPublish>) {
        entry.stop_timer();
        let weak = Arc::downgrade(inner);
        let timer_entry = entry.clone();
        let timeout = inner.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !timer_entry.is_pending() {
                return;
            }
            if !inner.connection.is_connected() {
                debug!(order = timer_entry.order, "confirm timed out while disconnected");
                return;
            }
            debug!(order = timer_entry.order, "no confirm within timeout, republishing");
            if let Err(error) = Inner::publish_entry(&inner, timer_entry.clone()).await {
                warn!(%error, order = timer_entry.order, "republish after timeout failed");
                Inner::arm_timer(&inner, timer_entry);
            }
        });
        *lock(&entry.timer) = Some(handle);
    }

    /// Resolve and evict everything the confirm frame covers. With
    /// `multiple` set that is every entry holding any id at or below
    /// `sequence`; each settled entry is evicted together with all of its
    /// historical ids and its timer is aborted.
    fn settle(&self, sequence: u64, multiple: bool, positive: bool) {
        let mut settled = Vec::new();
        {
            let mut entries = lock(&self.entries);
            let keys: Vec<u64> = if multiple {
                entries.range(..=sequence).map(|(k, _)| *k).collect()
            } else if entries.contains_key(&sequence) {
                vec![sequence]
            } else {
                Vec::new()
            };
            for key in keys {
                // Entries already evicted via a sibling id come back None.
                if let Some(entry) = entries.remove(&key) {
                    for id in lock(&entry.sequence_ids).iter() {
                        entries.remove(id);
                    }
                    settled.push(entry);
                }
            }
        }
        if settled.is_empty() {
            debug!(sequence, multiple, "confirm for unknown sequence ignored");
            return;
        }
        for entry in settled {
            let result = if positive {
                Ok(())
            } else {
                Err(BusError::PublishFailed { sequence })
            };
            entry.resolve(result);
        }
    }

    /// Stop all retry timers but keep every entry pending.
    fn suspend_timers(&self) {
        for entry in self.distinct_pending() {
            entry.stop_timer();
        }
    }

    /// Replay every distinct pending publish, deduplicated across its
    /// historical sequence ids, in original submission order, using the
    /// original publish closure.
    async fn replay_pending(inner: &Arc<Inner>) {
        let pending = inner.distinct_pending();
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "republishing unconfirmed messages after reconnect");
        for entry in pending {
            if !entry.is_pending() {
                continue;
            }
            if let Err(error) = Inner::publish_entry(inner, entry.clone()).await {
                warn!(%error, order = entry.order, "replay of pending publish failed");
                // keep the retry cycle alive; otherwise the entry would sit
                // pending until the next reconnect
                Inner::arm_timer(inner, entry);
            }
        }
    }

    fn distinct_pending(&self) -> Vec<Arc<PendingPublish>> {
        let entries = lock(&self.entries);
        let mut by_order: BTreeMap<u64, Arc<PendingPublish>> = BTreeMap::new();
        for entry in entries.values() {
            by_order.entry(entry.order).or_insert_with(|| entry.clone());
        }
        by_order.into_values().collect()
    }

    fn fail_all(&self, reason: &'static str) {
        let pending = self.distinct_pending();
        lock(&self.entries).clear();
        for entry in pending {
            entry.resolve(Err(BusError::Disposed(reason)));
        }
    }
}

/// Decorates a fire-and-forget channel publish with confirmed, retryable,
/// order-preserving semantics. Broker confirm frames arrive through the
/// mpsc receiver handed to [`ConfirmedPublisher::start`], wired up by the
/// channel open hook.
pub struct ConfirmedPublisher {
    inner: Arc<Inner>,
    listener: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ConfirmedPublisher {
    pub fn start(
        executor: Arc<CommandDispatcher>,
        connection: Arc<ConnectionManager>,
        timeout: Duration,
        mut confirms: mpsc::UnboundedReceiver<ConfirmEvent>,
    ) -> Arc<Self> {
        let inner = Arc::new(Inner {
            executor,
            connection: connection.clone(),
            timeout,
            entries: Mutex::new(BTreeMap::new()),
            next_order: AtomicU64::new(0),
            publish_gate: tokio::sync::Mutex::new(()),
        });

        let mut events = connection.subscribe();
        let listener_inner = inner.clone();
        let listener = tokio::spawn(async move {
            let mut events_open = true;
            loop {
                tokio::select! {
                    confirm = confirms.recv() => match confirm {
                        Some(ConfirmEvent::Ack { sequence, multiple }) => {
                            listener_inner.settle(sequence, multiple, true);
                        }
                        Some(ConfirmEvent::Nack { sequence, multiple }) => {
                            listener_inner.settle(sequence, multiple, false);
                        }
                        None => break,
                    },
                    event = events.recv(), if events_open => match event {
                        Ok(ConnectionEvent::Disconnected) => listener_inner.suspend_timers(),
                        Ok(ConnectionEvent::Connected) => {
                            Inner::replay_pending(&listener_inner).await;
                        }
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => {
                            events_open = false;
                        }
                    },
                }
            }
            debug!("confirm listener stopped");
        });

        Arc::new(Self {
            inner,
            listener: tokio::sync::Mutex::new(Some(listener)),
            disposed: AtomicBool::new(false),
        })
    }

    /// Publish through the raw `action` and wait for the broker to confirm.
    ///
    /// Completes with `Ok` on ack, [`BusError::PublishFailed`] on nack
    /// (terminal: an explicit rejection is never retried), or the dispatch
    /// error when the initial publish could not be issued at all. A missing
    /// confirm is republished after the configured timeout, indefinitely;
    /// the one returned future resolves exactly once no matter how many
    /// sequence ids the publish accumulates along the way.
    pub async fn publish(&self, action: ChannelAction) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BusError::Disposed("confirmed publisher"));
        }
        let (completed_tx, completed_rx) = oneshot::channel();
        let entry = Arc::new(PendingPublish {
            order: self.inner.next_order.fetch_add(1, Ordering::SeqCst),
            action,
            sequence_ids: Mutex::new(Vec::new()),
            completion: Mutex::new(Some(completed_tx)),
            timer: Mutex::new(None),
        });

        if let Err(error) = Inner::publish_entry(&self.inner, entry.clone()).await {
            // never issued; evict the bookkeeping and surface the failure
            {
                let mut entries = lock(&self.inner.entries);
                for id in lock(&entry.sequence_ids).iter() {
                    entries.remove(id);
                }
            }
            entry.stop_timer();
            return Err(error);
        }

        completed_rx
            .await
            .map_err(|_| BusError::Disposed("confirmed publisher"))?
    }

    /// Number of logical publishes still awaiting a confirm.
    pub fn pending_count(&self) -> usize {
        self.inner.distinct_pending().len()
    }

    /// Idempotent; stops the listener and fails every still-pending publish.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let listener = self.listener.lock().await.take();
        if let Some(handle) = listener {
            handle.abort();
        }
        self.inner.fail_all("confirmed publisher");
    }
}
