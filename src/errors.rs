use std::time::Duration;

use thiserror::Error;

/// Error taxonomy for the whole runtime.
///
/// Validation errors are synchronous and never retried. Connectivity errors
/// are retried with backoff inside the dispatchers and only become visible to
/// the application once a deadline is exceeded. A broker nack is always
/// surfaced as [`BusError::PublishFailed`] and never silently retried.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not connected to the broker")]
    NotConnected,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("broker rejected publish (nack) at sequence {sequence}")]
    PublishFailed { sequence: u64 },

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("{0} has been disposed")]
    Disposed(&'static str),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    /// Whether the guarded channel / outbound dispatcher may retry after this
    /// error. Validation problems, explicit nacks and terminal states are
    /// surfaced to the caller instead.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BusError::NotConnected | BusError::ChannelClosed(_) | BusError::Transport(_)
        )
    }
}

impl From<lapin::Error> for BusError {
    fn from(error: lapin::Error) -> Self {
        match error {
            lapin::Error::InvalidChannelState(state) => {
                BusError::ChannelClosed(format!("invalid channel state: {state:?}"))
            }
            lapin::Error::InvalidConnectionState(_) => BusError::NotConnected,
            other => BusError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_errors_are_recoverable() {
        assert!(BusError::NotConnected.is_recoverable());
        assert!(BusError::ChannelClosed("gone".into()).is_recoverable());
        assert!(BusError::Transport("io".into()).is_recoverable());
    }

    #[test]
    fn terminal_errors_are_not_retried() {
        assert!(!BusError::InvalidArgument("bad".into()).is_recoverable());
        assert!(!BusError::Timeout(Duration::from_secs(1)).is_recoverable());
        assert!(!BusError::PublishFailed { sequence: 7 }.is_recoverable());
        assert!(!BusError::Disposed("dispatcher").is_recoverable());
    }
}
