use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Error returned by a message handler; it aborts `listen` as-is.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A transport-level failure event. Values compare equal when the backend
/// reported the same failure, which is how repeated errors are detected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to subscribe: {0}")]
    Subscribe(String),

    #[error("failed to publish: {0}")]
    Publish(String),

    #[error("failed to receive: {0}")]
    Receive(String),

    #[error("subscription closed by the server")]
    Closed,
}

#[derive(Error, Debug)]
pub enum TransportError {
    /// The same failure was observed twice in a row
    #[error("transport error: {0}")]
    Connection(ConnectionError),

    #[error("exhausted {attempts} reconnect attempts, last error: {last}")]
    Exhausted {
        attempts: u32,
        last: ConnectionError,
    },

    #[error("message handler failed: {0}")]
    Handler(#[source] HandlerError),
}

impl TransportError {
    /// The underlying connection failure, if this error came from the
    /// transport rather than the handler.
    pub fn connection_error(&self) -> Option<&ConnectionError> {
        match self {
            Self::Connection(err) | Self::Exhausted { last: err, .. } => Some(err),
            Self::Handler(_) => None,
        }
    }
}
