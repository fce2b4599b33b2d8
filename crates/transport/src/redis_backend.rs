use crate::backoff::Backoff;
use crate::error::ConnectionError;
use crate::pubsub::{Connector, PubSubTransport, Subscription};
use async_trait::async_trait;
use futures::StreamExt;
use redis::{AsyncCommands, IntoConnectionInfo};
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1_000);

pub type RedisTransport = PubSubTransport<RedisConnector>;

/// Redis pub/sub backend. Every subscribe opens a dedicated connection;
/// publishes use a short-lived multiplexed connection.
pub struct RedisConnector {
    client: redis::Client,
    connect_timeout: Duration,
}

impl RedisConnector {
    pub fn new(
        url: &str,
        password: Option<&str>,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let mut info = url
            .into_connection_info()
            .map_err(|err| ConnectionError::Connect(err.to_string()))?;
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            info.redis.password = Some(password.to_string());
        }
        let client =
            redis::Client::open(info).map_err(|err| ConnectionError::Connect(err.to_string()))?;
        Ok(Self {
            client,
            connect_timeout,
        })
    }

    pub fn into_transport(self, channel: impl Into<String>, backoff: Backoff) -> RedisTransport {
        PubSubTransport::new(self, channel, backoff)
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, ConnectionError> {
        let mut pubsub = tokio::time::timeout(self.connect_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| ConnectionError::Timeout(self.connect_timeout))?
            .map_err(|err| ConnectionError::Connect(err.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|err| ConnectionError::Subscribe(err.to_string()))?;
        Ok(Box::new(RedisSubscription {
            pubsub,
            channel: channel.to_string(),
        }))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, ConnectionError> {
        let mut conn = tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| ConnectionError::Timeout(self.connect_timeout))?
        .map_err(|err| ConnectionError::Connect(err.to_string()))?;
        let receivers: usize = conn
            .publish(channel, message)
            .await
            .map_err(|err| ConnectionError::Publish(err.to_string()))?;
        Ok(receivers)
    }
}

struct RedisSubscription {
    pubsub: redis::aio::PubSub,
    channel: String,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self) -> Result<String, ConnectionError> {
        let msg = self
            .pubsub
            .on_message()
            .next()
            .await
            .ok_or(ConnectionError::Closed)?;
        msg.get_payload::<String>()
            .map_err(|err| ConnectionError::Receive(err.to_string()))
    }

    async fn unsubscribe(&mut self) -> Result<(), ConnectionError> {
        self.pubsub
            .unsubscribe(self.channel.as_str())
            .await
            .map_err(|err| ConnectionError::Subscribe(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_url() {
        let err = RedisConnector::new("not a url", None, DEFAULT_CONNECT_TIMEOUT)
            .err()
            .expect("malformed url must fail");
        assert!(matches!(err, ConnectionError::Connect(_)));
    }

    #[test]
    fn accepts_password_override() {
        let connector =
            RedisConnector::new("redis://127.0.0.1:6379", Some("pw"), DEFAULT_CONNECT_TIMEOUT)
                .expect("valid url");
        assert_eq!(
            connector.client.get_connection_info().redis.password.as_deref(),
            Some("pw")
        );
    }
}
