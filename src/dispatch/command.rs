//! Bounded single-writer queue for channel-affecting commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::{ChannelAction, GuardedChannel, OpenHook};
use crate::connection::ConnectionManager;
use crate::errors::{BusError, Result};

struct Command {
    action: ChannelAction,
    completed: oneshot::Sender<Result<()>>,
}

/// Serializes all channel creation and administrative commands through one
/// worker owning a [`GuardedChannel`]. The queue capacity is 1: `invoke`
/// suspends the caller until the previous action has been dequeued, which is
/// the backpressure contract, and guarantees true single-writer access to
/// the channel handle.
pub struct CommandDispatcher {
    queue: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl CommandDispatcher {
    pub fn start(
        connection: Arc<ConnectionManager>,
        timeout: Duration,
        open_hooks: Vec<OpenHook>,
    ) -> Arc<Self> {
        let (queue_tx, mut queue_rx) = mpsc::channel::<Command>(1);
        let worker = tokio::spawn(async move {
            let mut channel = GuardedChannel::new(connection, timeout, open_hooks);
            while let Some(command) = queue_rx.recv().await {
                let result = channel.invoke(&command.action).await;
                if let Err(error) = &result {
                    warn!(%error, "dispatched command failed");
                }
                // the caller may have given up waiting; that is fine
                let _ = command.completed.send(result);
            }
            channel.dispose().await;
            debug!("command dispatcher worker stopped");
        });
        Arc::new(Self {
            queue: Mutex::new(Some(queue_tx)),
            worker: Mutex::new(Some(worker)),
            disposed: AtomicBool::new(false),
        })
    }

    /// Queue `action` and wait for the worker to execute it. Completes with
    /// the action's own result, or [`BusError::Disposed`] once the
    /// dispatcher has been shut down.
    pub async fn invoke(&self, action: ChannelAction) -> Result<()> {
        let sender = self
            .queue
            .lock()
            .await
            .clone()
            .ok_or(BusError::Disposed("command dispatcher"))?;
        let (completed_tx, completed_rx) = oneshot::channel();
        sender
            .send(Command {
                action,
                completed: completed_tx,
            })
            .await
            .map_err(|_| BusError::Disposed("command dispatcher"))?;
        completed_rx
            .await
            .map_err(|_| BusError::Disposed("command dispatcher"))?
    }

    /// Idempotent; cancels the worker after the in-flight command finishes
    /// and releases the channel. Subsequent `invoke` calls fail.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.lock().await.take();
        let worker = self.worker.lock().await.take();
        if let Some(handle) = worker {
            let _ = handle.await;
        }
    }
}
