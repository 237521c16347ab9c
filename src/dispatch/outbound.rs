//! Unbounded outbound queue gated on connectivity. Queued work survives
//! disconnects; a dequeued action is retried until it succeeds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::{ChannelAction, GuardedChannel, OpenHook};
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::errors::{BusError, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Gates message publication on connection state. Unlike the command
/// dispatcher's bounded queue, nothing is dropped here: the gate simply
/// blocks dequeues while disconnected and replays once reconnected.
///
/// This dispatcher owns the connection's lifetime: disposing it drains the
/// queue and then disposes the connection manager.
pub struct OutboundDispatcher {
    queue: Mutex<Option<mpsc::UnboundedSender<ChannelAction>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    connection: Arc<ConnectionManager>,
    disposed: AtomicBool,
}

impl OutboundDispatcher {
    pub fn start(
        connection: Arc<ConnectionManager>,
        timeout: Duration,
        retry_cap: Duration,
        open_hooks: Vec<OpenHook>,
    ) -> Arc<Self> {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<ChannelAction>();
        let (gate_tx, gate_rx) = watch::channel(connection.is_connected());

        let mut events = connection.subscribe();
        let gate_task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Connected) => {
                        let _ = gate_tx.send(true);
                    }
                    Ok(ConnectionEvent::Disconnected) => {
                        let _ = gate_tx.send(false);
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let worker_connection = connection.clone();
        let worker = tokio::spawn(async move {
            let mut channel = GuardedChannel::new(worker_connection, timeout, open_hooks);
            let mut gate = gate_rx;
            while let Some(action) = queue_rx.recv().await {
                // hold until the broker is reachable again
                while !*gate.borrow() {
                    if gate.changed().await.is_err() {
                        break;
                    }
                }
                let mut backoff = INITIAL_BACKOFF;
                loop {
                    match channel.invoke(&action).await {
                        Ok(()) => break,
                        Err(error) => {
                            warn!(%error, backoff = ?backoff, "outbound action failed, retrying");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(retry_cap);
                        }
                    }
                }
            }
            channel.dispose().await;
            gate_task.abort();
            debug!("outbound dispatcher worker stopped");
        });

        Arc::new(Self {
            queue: Mutex::new(Some(queue_tx)),
            worker: Mutex::new(Some(worker)),
            connection,
            disposed: AtomicBool::new(false),
        })
    }

    /// Enqueue an action; it will run once a connection is available and is
    /// never dropped after that, no matter how often it has to be retried.
    pub async fn invoke(&self, action: ChannelAction) -> Result<()> {
        let sender = self
            .queue
            .lock()
            .await
            .clone()
            .ok_or(BusError::Disposed("outbound dispatcher"))?;
        sender
            .send(action)
            .map_err(|_| BusError::Disposed("outbound dispatcher"))
    }

    /// Complete the queue, wait for the worker to drain every remaining
    /// action, then dispose the connection.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.lock().await.take();
        let worker = self.worker.lock().await.take();
        if let Some(handle) = worker {
            let _ = handle.await;
        }
        self.connection.dispose().await;
    }
}
