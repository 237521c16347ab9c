//! Resilient messaging runtime on top of AMQP.
//!
//! The crate keeps a single supervised broker connection alive, funnels all
//! channel work through single-writer dispatch queues, tracks publisher
//! confirms with timeout-driven republish and post-reconnect replay, and runs
//! consumers as small state machines that survive broker cancels and
//! connection loss.
//!
//! Entry point is [`MessageBus`]; the lower layers are public for
//! applications that want to assemble their own stack.

pub mod bus;
pub mod channel;
pub mod config;
pub mod confirms;
pub mod connection;
pub mod consumer;
pub mod dispatch;
pub mod errors;
pub mod naming;
pub mod serialize;
pub mod testing;
pub mod topology;
pub mod transport;

mod util;

pub use bus::{publish_action, MessageBus};
pub use channel::{channel_action, open_hook, ChannelAction, GuardedChannel, OpenHook};
pub use config::BrokerConfig;
pub use confirms::ConfirmedPublisher;
pub use connection::{ConnectionEvent, ConnectionManager};
pub use consumer::{delivery_handler, Consumer, ConsumerState, DeliveryHandler, HandlerOutcome};
pub use dispatch::{CommandDispatcher, InboundDispatcher, OutboundDispatcher};
pub use errors::{BusError, Result};
pub use naming::{Conventions, DefaultConventions};
pub use serialize::{JsonSerializer, RawMessage};
pub use topology::{ExchangeSpec, ExchangeType, QueueSpec};
pub use transport::{
    ConfirmEvent, ConsumeOptions, Delivery, ManagedChannel, ManagedConnection, MessageProperties,
    PublishArgs, Transport,
};
