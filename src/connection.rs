//! Connection supervision: one live transport connection at a time, fixed
//! delay retries while the broker is unreachable, reconnect after shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::errors::{BusError, Result};
use crate::transport::{ManagedChannel, ManagedConnection, Transport};
use crate::util::lock;

/// State transition published on the broadcast channel. Components subscribe
/// explicitly at construction instead of hooking per-connection events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

const EVENT_CAPACITY: usize = 64;

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    current: RwLock<Option<Arc<dyn ManagedConnection>>>,
    events: broadcast::Sender<ConnectionEvent>,
    retry_delay: Duration,
    disposed: AtomicBool,
    shutdown: watch::Sender<bool>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Spawn the supervisor and begin connecting immediately. Connect
    /// failures are non-fatal: the supervisor retries after `retry_delay`
    /// until disposed.
    pub fn start(transport: Arc<dyn Transport>, retry_delay: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let manager = Arc::new(Self {
            transport,
            current: RwLock::new(None),
            events,
            retry_delay,
            disposed: AtomicBool::new(false),
            shutdown,
            supervisor: std::sync::Mutex::new(None),
        });
        let handle = tokio::spawn(Self::supervise(manager.clone()));
        *lock(&manager.supervisor) = Some(handle);
        manager
    }

    async fn supervise(manager: Arc<Self>) {
        let mut shutdown = manager.shutdown.subscribe();
        loop {
            if manager.disposed.load(Ordering::SeqCst) {
                return;
            }
            match manager.transport.connect().await {
                Ok(connection) => {
                    let (lost_tx, mut lost_rx) = mpsc::unbounded_channel::<String>();
                    connection.on_shutdown(Arc::new(move |reason| {
                        let _ = lost_tx.send(reason);
                    }));
                    manager.store_connection(Some(connection.clone()));
                    info!("connected to broker");
                    let _ = manager.events.send(ConnectionEvent::Connected);

                    tokio::select! {
                        reason = lost_rx.recv() => {
                            warn!(
                                reason = reason.as_deref().unwrap_or("unknown"),
                                "broker connection lost"
                            );
                            manager.store_connection(None);
                            let _ = manager.events.send(ConnectionEvent::Disconnected);
                            // fall through and reconnect
                        }
                        _ = shutdown.changed() => {
                            manager.store_connection(None);
                            let _ = connection.close().await;
                            return;
                        }
                    }
                }
                Err(error) => {
                    let delay = manager.jittered_retry_delay();
                    warn!(%error, ?delay, "broker unreachable, retrying");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
    }

    fn jittered_retry_delay(&self) -> Duration {
        // +/-15% so a fleet of clients does not reconnect in lockstep
        let base = self.retry_delay.as_millis() as f64;
        let jitter = (rand::random::<f64>() * 0.3 - 0.15) * base;
        Duration::from_millis((base + jitter).max(1.0) as u64)
    }

    fn store_connection(&self, connection: Option<Arc<dyn ManagedConnection>>) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = connection;
    }

    fn connection(&self) -> Option<Arc<dyn ManagedConnection>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some_and(|c| c.is_connected())
    }

    /// Open a new channel on the live connection. Fails immediately with
    /// [`BusError::NotConnected`] while down; retry policy belongs to the
    /// caller's dispatcher, not to the connection layer.
    pub async fn create_channel(&self) -> Result<Arc<dyn ManagedChannel>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BusError::Disposed("connection manager"));
        }
        let connection = self.connection().ok_or(BusError::NotConnected)?;
        if !connection.is_connected() {
            return Err(BusError::NotConnected);
        }
        connection.create_channel().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Block until the broker is reachable or `limit` elapses.
    pub async fn wait_connected(&self, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        let mut events = self.subscribe();
        while !self.is_connected() {
            let now = Instant::now();
            if now >= deadline {
                return Err(BusError::Timeout(limit));
            }
            match tokio::time::timeout(deadline - now, events.recv()).await {
                Ok(Ok(_)) => continue,
                Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => return Err(BusError::Disposed("connection manager")),
                Err(_) => return Err(BusError::Timeout(limit)),
            }
        }
        Ok(())
    }

    /// Terminal and idempotent: stops the supervisor and closes the
    /// transport. Subsequent `create_channel` calls fail.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("disposing connection manager");
        let _ = self.shutdown.send(true);
        let supervisor = lock(&self.supervisor).take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        if let Some(connection) = self.connection() {
            let _ = connection.close().await;
        }
        self.store_connection(None);
    }
}
