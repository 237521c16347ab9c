//! Per-consumer delivery queue. Strict FIFO within one dispatcher; queued
//! work is discarded on disconnect because the broker will redeliver.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::errors::{BusError, Result};

struct Job {
    run: BoxFuture<'static, ()>,
    completed: oneshot::Sender<()>,
}

/// Serializes message-handler invocations for one consumer. The worker
/// itself drains the queue when the connection drops, so draining can never
/// race with the next dequeue.
pub struct InboundDispatcher {
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl InboundDispatcher {
    pub fn start(connection: &ConnectionManager) -> Arc<Self> {
        let mut events = connection.subscribe();
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Job>();
        let worker = tokio::spawn(async move {
            let mut events_open = true;
            loop {
                if events_open {
                    tokio::select! {
                        biased;
                        event = events.recv() => match event {
                            Ok(ConnectionEvent::Disconnected) => {
                                let mut discarded = 0usize;
                                while queue_rx.try_recv().is_ok() {
                                    discarded += 1;
                                }
                                if discarded > 0 {
                                    debug!(discarded, "dropped queued deliveries after disconnect");
                                }
                            }
                            Ok(ConnectionEvent::Connected) => {}
                            Err(RecvError::Lagged(_)) => {}
                            Err(RecvError::Closed) => {
                                events_open = false;
                            }
                        },
                        job = queue_rx.recv() => match job {
                            Some(job) => {
                                job.run.await;
                                let _ = job.completed.send(());
                            }
                            None => break,
                        },
                    }
                } else {
                    match queue_rx.recv().await {
                        Some(job) => {
                            job.run.await;
                            let _ = job.completed.send(());
                        }
                        None => break,
                    }
                }
            }
            debug!("inbound dispatcher worker stopped");
        });
        Arc::new(Self {
            queue: Mutex::new(Some(queue_tx)),
            worker: Mutex::new(Some(worker)),
            disposed: AtomicBool::new(false),
        })
    }

    /// Enqueue handler work. The returned receiver fires when the work has
    /// run; it errors instead if the work was discarded by a disconnect or
    /// by disposal.
    pub async fn invoke<F>(&self, work: F) -> Result<oneshot::Receiver<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BusError::Disposed("inbound dispatcher"));
        }
        let sender = self
            .queue
            .lock()
            .await
            .clone()
            .ok_or(BusError::Disposed("inbound dispatcher"))?;
        let (completed_tx, completed_rx) = oneshot::channel();
        sender
            .send(Job {
                run: work.boxed(),
                completed: completed_tx,
            })
            .map_err(|_| BusError::Disposed("inbound dispatcher"))?;
        Ok(completed_rx)
    }

    /// Idempotent; completes the queue and stops the worker after the job in
    /// flight finishes.
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
