//! Seam between the runtime and the broker client library.
//!
//! The runtime never touches the wire protocol itself; it orchestrates the
//! capability set below. The production implementation lives in
//! [`lapin`](self::lapin); tests drive the same traits through the fakes in
//! [`crate::testing`].

pub mod lapin;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::topology::{ExchangeSpec, QueueSpec};

/// Observer invoked when the broker connection shuts down involuntarily.
pub type ShutdownCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Observer invoked for broker ack/nack confirm frames.
pub type ConfirmCallback = Arc<dyn Fn(ConfirmEvent) + Send + Sync>;

/// Broker confirm frame. `multiple` means "this sequence number and every
/// outstanding one below it".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmEvent {
    Ack { sequence: u64, multiple: bool },
    Nack { sequence: u64, multiple: bool },
}

/// Subset of AMQP basic properties the runtime cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub persistent: bool,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct PublishArgs {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum ConsumerEvent {
    Delivery(Delivery),
    /// Broker-initiated cancel (queue deleted, HA failover, ...).
    Cancelled,
}

/// Live subscription: the broker-assigned tag plus the delivery stream.
/// The stream ends when the channel dies.
pub struct ConsumerStream {
    pub tag: String,
    pub events: mpsc::UnboundedReceiver<ConsumerEvent>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumeOptions {
    pub exclusive: bool,
    pub no_ack: bool,
    pub cancel_on_ha_failover: bool,
}

/// Factory for broker connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ManagedConnection>>;
}

/// One physical connection to the broker.
#[async_trait]
pub trait ManagedConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn ManagedChannel>>;

    /// Register an observer for involuntary shutdown. Fired at most once.
    fn on_shutdown(&self, callback: ShutdownCallback);

    async fn close(&self) -> Result<()>;
}

/// One logical channel. Not safe for concurrent use; the dispatchers enforce
/// single-writer access, the trait itself does not.
#[async_trait]
pub trait ManagedChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn confirm_select(&self) -> Result<()>;

    /// Sequence number the next publish on this channel will be assigned.
    fn next_publish_seq_no(&self) -> u64;

    /// Register an observer for publish confirms. Requires `confirm_select`.
    fn on_confirm(&self, callback: ConfirmCallback);

    async fn basic_publish(&self, args: &PublishArgs) -> Result<()>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    /// Declare a queue; returns the actual (possibly server-assigned) name.
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<String>;

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<ConsumerStream>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
