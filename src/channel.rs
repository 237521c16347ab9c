//! Guarded access to one logical channel: lazily opened, reopened with
//! exponential backoff after failures, bounded by an overall deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use crate::connection::ConnectionManager;
use crate::errors::{BusError, Result};
use crate::transport::ManagedChannel;

/// A unit of work executed against a live channel. Retried as a whole after
/// recoverable failures, so actions should be idempotent; that is the
/// caller's responsibility, not something the wrapper can guarantee.
pub type ChannelAction =
    Arc<dyn Fn(Arc<dyn ManagedChannel>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Run once against every channel this wrapper opens (QoS, confirm-select,
/// confirm observer wiring).
pub type OpenHook =
    Arc<dyn Fn(Arc<dyn ManagedChannel>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub fn channel_action<F, Fut>(action: F) -> ChannelAction
where
    F: Fn(Arc<dyn ManagedChannel>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |channel| action(channel).boxed())
}

pub fn open_hook<F, Fut>(hook: F) -> OpenHook
where
    F: Fn(Arc<dyn ManagedChannel>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |channel| hook(channel).boxed())
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Exclusively owned by one dispatcher worker; never shared across tasks.
pub struct GuardedChannel {
    connection: Arc<ConnectionManager>,
    channel: Option<Arc<dyn ManagedChannel>>,
    open_hooks: Vec<OpenHook>,
    timeout: Duration,
}

impl GuardedChannel {
    pub fn new(
        connection: Arc<ConnectionManager>,
        timeout: Duration,
        open_hooks: Vec<OpenHook>,
    ) -> Self {
        Self {
            connection,
            channel: None,
            open_hooks,
            timeout,
        }
    }

    /// Execute `action` against a live channel, opening one if necessary.
    ///
    /// Recoverable failures drop the channel and retry with exponential
    /// backoff (100ms doubling, 5s cap) until the deadline measured from the
    /// first attempt runs out, at which point [`BusError::Timeout`] is
    /// surfaced and no further retry happens.
    pub async fn invoke(&mut self, action: &ChannelAction) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.try_invoke(action).await {
                Ok(()) => return Ok(()),
                Err(error) if error.is_recoverable() => {
                    debug!(%error, "guarded channel action failed, will retry");
                    self.channel = None;
                }
                Err(error) => return Err(error),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(timeout = ?self.timeout, "guarded channel invocation deadline exceeded");
                return Err(BusError::Timeout(self.timeout));
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn try_invoke(&mut self, action: &ChannelAction) -> Result<()> {
        let channel = self.live_channel().await?;
        action(channel).await
    }

    async fn live_channel(&mut self) -> Result<Arc<dyn ManagedChannel>> {
        if let Some(channel) = &self.channel {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            self.channel = None;
        }
        let channel = self.connection.create_channel().await?;
        for hook in &self.open_hooks {
            hook(channel.clone()).await?;
        }
        debug!("opened new channel");
        self.channel = Some(channel.clone());
        Ok(channel)
    }

    /// Close the underlying channel if one is open. Safe to call repeatedly.
    pub async fn dispose(&mut self) {
        if let Some(channel) = self.channel.take() {
            let _ = channel.close().await;
        }
    }
}
