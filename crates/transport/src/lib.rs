//! Message transport between the collector and its agents.
//!
//! A [`Transport`] is bound to one channel. `publish` fans a message out to
//! every current subscriber; `listen` feeds received messages to a
//! [`MessageHandler`] until the handler asks to disconnect, the caller calls
//! [`Transport::stop_listening`], or the connection cannot be recovered.
//!
//! ```no_run
//! use sshkey_transport::{Backoff, RedisConnector, Transport, DEFAULT_CONNECT_TIMEOUT};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = RedisConnector::new("redis://127.0.0.1:6379", None, DEFAULT_CONNECT_TIMEOUT)?
//!     .into_transport("sshkey_provider:sre", Backoff::default());
//! transport.publish("{}").await?;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod error;
mod pubsub;
mod redis_backend;

pub use backoff::{Backoff, DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_BACKOFF};
pub use error::{ConnectionError, HandlerError, Result, TransportError};
pub use pubsub::{Connector, PubSubTransport, Subscription};
pub use redis_backend::{RedisConnector, RedisTransport, DEFAULT_CONNECT_TIMEOUT};

use async_trait::async_trait;

/// What `listen` should do after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Continue,
    Disconnect,
}

#[async_trait]
pub trait MessageHandler: Send {
    async fn handle(&mut self, message: String) -> std::result::Result<Delivery, HandlerError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, message: &str) -> Result<usize>;

    /// Blocks until the handler disconnects (`Ok`), `stop_listening` is
    /// called (`Ok`), the handler fails, or reconnecting gives up.
    async fn listen(&self, handler: &mut dyn MessageHandler) -> Result<()>;

    /// Interrupts an in-progress `listen`, including one blocked on a
    /// receive or a backoff sleep.
    fn stop_listening(&self) -> Result<()>;
}
