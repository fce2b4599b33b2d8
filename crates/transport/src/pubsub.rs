use crate::backoff::Backoff;
use crate::error::{ConnectionError, Result, TransportError};
use crate::{Delivery, MessageHandler, Transport};
use async_trait::async_trait;
use tokio::sync::watch;

/// An established subscription to one channel.
///
/// `next_message` must be cancel-safe: `listen` races it against the stop
/// signal.
#[async_trait]
pub trait Subscription: Send {
    async fn next_message(&mut self) -> std::result::Result<String, ConnectionError>;

    async fn unsubscribe(&mut self) -> std::result::Result<(), ConnectionError>;
}

/// Backend that can open subscriptions and publish messages.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn subscribe(
        &self,
        channel: &str,
    ) -> std::result::Result<Box<dyn Subscription>, ConnectionError>;

    /// Publishes `message`, returning how many subscribers received it.
    async fn publish(
        &self,
        channel: &str,
        message: &str,
    ) -> std::result::Result<usize, ConnectionError>;
}

/// Single-channel transport that keeps a subscription alive across
/// connection failures.
///
/// Reconnect rules:
/// - attempt `n` waits `n * backoff.base` before re-subscribing;
/// - the same failure twice in a row aborts immediately;
/// - more than `backoff.max_attempts` consecutive failures abort;
/// - a successful subscribe resets both counters.
pub struct PubSubTransport<C> {
    connector: C,
    channel: String,
    backoff: Backoff,
    stop_tx: watch::Sender<u64>,
}

enum PumpExit {
    Finished,
    Failed(ConnectionError),
}

impl<C: Connector> PubSubTransport<C> {
    pub fn new(connector: C, channel: impl Into<String>, backoff: Backoff) -> Self {
        let (stop_tx, _) = watch::channel(0);
        Self {
            connector,
            channel: channel.into(),
            backoff,
            stop_tx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    async fn pump(
        &self,
        subscription: &mut dyn Subscription,
        handler: &mut dyn MessageHandler,
        stop_rx: &mut watch::Receiver<u64>,
    ) -> Result<PumpExit> {
        loop {
            let received = tokio::select! {
                biased;
                _ = stop_rx.changed() => {
                    log::info!("Stopped listening on '{}'", self.channel);
                    self.release(subscription).await;
                    return Ok(PumpExit::Finished);
                }
                received = subscription.next_message() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(err) => return Ok(PumpExit::Failed(err)),
            };
            log::debug!("Received message on '{}' ({} bytes)", self.channel, message.len());

            match handler.handle(message).await {
                Ok(Delivery::Continue) => {}
                Ok(Delivery::Disconnect) => {
                    log::info!("Handler requested disconnect from '{}'", self.channel);
                    self.release(subscription).await;
                    return Ok(PumpExit::Finished);
                }
                Err(err) => return Err(TransportError::Handler(err)),
            }
        }
    }

    async fn release(&self, subscription: &mut dyn Subscription) {
        if let Err(err) = subscription.unsubscribe().await {
            log::debug!("Unsubscribe from '{}' failed: {err}", self.channel);
        }
    }
}

#[async_trait]
impl<C: Connector> Transport for PubSubTransport<C> {
    async fn publish(&self, message: &str) -> Result<usize> {
        let receivers = self
            .connector
            .publish(&self.channel, message)
            .await
            .map_err(TransportError::Connection)?;
        log::info!(
            "Published message to {receivers} subscriber(s) on '{}'",
            self.channel
        );
        Ok(receivers)
    }

    async fn listen(&self, handler: &mut dyn MessageHandler) -> Result<()> {
        // Only stop requests issued after this point count.
        let mut stop_rx = self.stop_tx.subscribe();
        let mut attempt: u32 = 0;
        let mut last_error: Option<ConnectionError> = None;

        loop {
            let subscribed = tokio::select! {
                biased;
                _ = stop_rx.changed() => return Ok(()),
                subscribed = self.connector.subscribe(&self.channel) => subscribed,
            };

            let failure = match subscribed {
                Ok(mut subscription) => {
                    log::info!("Listening for messages on '{}'", self.channel);
                    attempt = 0;
                    last_error = None;
                    match self.pump(subscription.as_mut(), handler, &mut stop_rx).await? {
                        PumpExit::Finished => return Ok(()),
                        PumpExit::Failed(err) => err,
                    }
                }
                Err(err) => err,
            };

            log::warn!("Listener on '{}' failed: {failure}", self.channel);
            if last_error.as_ref() == Some(&failure) {
                log::error!("Same error occurred twice in a row on '{}', giving up", self.channel);
                return Err(TransportError::Connection(failure));
            }
            attempt += 1;
            if !self.backoff.allows(attempt) {
                return Err(TransportError::Exhausted {
                    attempts: attempt - 1,
                    last: failure,
                });
            }

            let delay = self.backoff.delay(attempt);
            log::info!(
                "Reconnecting to '{}' in {delay:?} (attempt {attempt}/{})",
                self.channel,
                self.backoff.max_attempts
            );
            last_error = Some(failure);
            tokio::select! {
                biased;
                _ = stop_rx.changed() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn stop_listening(&self) -> Result<()> {
        self.stop_tx
            .send_modify(|generation| *generation = generation.wrapping_add(1));
        Ok(())
    }
}
