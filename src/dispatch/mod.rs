//! Single-consumer queues enforcing ordered, serialized execution of actions
//! against shared broker resources. The channel handle is not thread-safe;
//! no action from the same queue ever overlaps another.

mod command;
mod inbound;
mod outbound;

pub use command::CommandDispatcher;
pub use inbound::InboundDispatcher;
pub use outbound::OutboundDispatcher;
