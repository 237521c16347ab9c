//! Immutable queue/exchange descriptors, validated at construction.

use crate::errors::{BusError, Result};

/// AMQP limits short strings (entity names) to 255 bytes.
pub const MAX_NAME_LENGTH: usize = 255;

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(BusError::InvalidArgument(format!(
            "{kind} name exceeds {MAX_NAME_LENGTH} characters: {} characters",
            name.len()
        )));
    }
    Ok(())
}

/// Queue descriptor. An empty name asks the broker for a server-named queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Vec<(String, String)>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name("queue", &name)?;
        Ok(Self {
            name,
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Vec::new(),
        })
    }

    /// Exclusive, auto-deleting, server-named queue for transient consumers.
    pub fn server_named() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
            arguments: Vec::new(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.push((key.into(), value.into()));
        self
    }

    /// Route rejected messages to the given dead-letter exchange.
    pub fn with_dead_letter(self, exchange: impl Into<String>) -> Self {
        self.with_argument("x-dead-letter-exchange", exchange)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

/// Exchange descriptor. An empty name is the broker's default exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub exchange_type: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, exchange_type: ExchangeType) -> Result<Self> {
        let name = name.into();
        validate_name("exchange", &name)?;
        Ok(Self {
            name,
            exchange_type,
            durable: true,
            auto_delete: false,
        })
    }

    pub fn direct(name: impl Into<String>) -> Result<Self> {
        Self::new(name, ExchangeType::Direct)
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_empty_queue_name() {
        let queue = QueueSpec::new("").expect("server-named queue allowed");
        assert!(queue.name.is_empty());
    }

    #[test]
    fn rejects_overlong_names() {
        let long = "q".repeat(256);
        assert!(matches!(
            QueueSpec::new(long.clone()),
            Err(BusError::InvalidArgument(_))
        ));
        assert!(matches!(
            ExchangeSpec::direct(long),
            Err(BusError::InvalidArgument(_))
        ));
    }

    #[test]
    fn dead_letter_argument_is_recorded() {
        let queue = QueueSpec::new("orders")
            .expect("valid")
            .with_dead_letter("orders.dlx");
        assert_eq!(
            queue.arguments,
            vec![("x-dead-letter-exchange".to_string(), "orders.dlx".to_string())]
        );
    }

    #[test]
    fn boundary_name_is_accepted() {
        let name = "q".repeat(255);
        assert!(QueueSpec::new(name).is_ok());
    }
}
