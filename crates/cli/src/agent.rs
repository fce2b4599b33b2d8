use crate::client::{CollectorClient, PollOutcome};
use crate::shutdown::{is_shutting_down, wait_for_shutdown};
use async_trait::async_trait;
use sshkey_authorized_keys::{render, update, AuthorizedKeysError, MissingFilePolicy, UpdateOutcome};
use sshkey_transport::{Delivery, HandlerError, MessageHandler, Transport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Applies snippets to one authorized_keys file.
#[derive(Clone, Debug)]
pub struct KeyFileWriter {
    path: PathBuf,
    missing: MissingFilePolicy,
}

impl KeyFileWriter {
    pub fn new(path: impl Into<PathBuf>, missing: MissingFilePolicy) -> Self {
        Self {
            path: path.into(),
            missing,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn apply(&self, snippet: String) -> Result<UpdateOutcome, AuthorizedKeysError> {
        let path = self.path.clone();
        let missing = self.missing;
        tokio::task::spawn_blocking(move || update(&path, &snippet, missing))
            .await
            .map_err(|err| AuthorizedKeysError::Io(std::io::Error::other(err)))?
    }

    /// Like [`Self::apply`], but only logs the outcome. A malformed file is
    /// left alone and retried with the next snippet.
    pub async fn apply_logged(&self, snippet: String) -> Option<UpdateOutcome> {
        log::info!("Updating {}", self.path.display());
        match self.apply(snippet).await {
            Ok(UpdateOutcome::Updated) => {
                log::info!("Updated {}", self.path.display());
                Some(UpdateOutcome::Updated)
            }
            Ok(UpdateOutcome::NotChanged) => {
                log::info!("The snippet makes no changes to {}, ignoring", self.path.display());
                Some(UpdateOutcome::NotChanged)
            }
            Err(err) if err.is_malformed() => {
                log::error!(
                    "Refusing to touch malformed {}: {err}",
                    self.path.display()
                );
                None
            }
            Err(err) => {
                log::error!("Cannot update {}: {err}", self.path.display());
                None
            }
        }
    }
}

struct SnippetHandler<'a> {
    writer: &'a KeyFileWriter,
}

#[async_trait]
impl MessageHandler for SnippetHandler<'_> {
    async fn handle(&mut self, message: String) -> Result<Delivery, HandlerError> {
        self.writer.apply_logged(message).await;
        Ok(Delivery::Continue)
    }
}

/// Where an agent gets its snippets from.
pub enum AgentSource {
    /// Pub/sub subscription, optionally seeded over HTTP on every
    /// (re)connect.
    Push {
        transport: Arc<dyn Transport>,
        bootstrap: Option<CollectorClient>,
    },
    /// Long-poll loop against the collector.
    Poll { client: CollectorClient },
}

pub struct Agent {
    team: String,
    writer: KeyFileWriter,
    source: AgentSource,
    recover_interval: Duration,
}

impl Agent {
    pub fn new(
        team: impl Into<String>,
        writer: KeyFileWriter,
        source: AgentSource,
        recover_interval: Duration,
    ) -> Self {
        Self {
            team: team.into(),
            writer,
            source,
            recover_interval,
        }
    }

    /// Runs until shutdown. Transport and collector failures are retried
    /// after the recovery interval, without limit.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        log::info!(
            "Starting agent for team '{}' on {} [recover_interval={:?}]",
            self.team,
            self.writer.path().display(),
            self.recover_interval
        );
        match &self.source {
            AgentSource::Push {
                transport,
                bootstrap,
            } => {
                self.run_push(transport.as_ref(), bootstrap.as_ref(), shutdown)
                    .await
            }
            AgentSource::Poll { client } => self.run_poll(client, shutdown).await,
        }
        log::info!("Agent stopped");
    }

    async fn run_push(
        &self,
        transport: &dyn Transport,
        bootstrap: Option<&CollectorClient>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        while !is_shutting_down(&shutdown) {
            if let Some(client) = bootstrap {
                self.bootstrap(client).await;
            }

            let mut handler = SnippetHandler {
                writer: &self.writer,
            };
            let listen = transport.listen(&mut handler);
            tokio::pin!(listen);
            // `listen` is polled first so its stop receiver exists before
            // `stop_listening` can fire.
            let result = tokio::select! {
                biased;
                result = &mut listen => result,
                _ = wait_for_shutdown(&mut shutdown) => {
                    if let Err(err) = transport.stop_listening() {
                        log::warn!("Cannot stop listener: {err}");
                        return;
                    }
                    listen.await
                }
            };
            if let Err(err) = result {
                log::error!("Listener failed: {err}");
            }
            if !self.recover(&mut shutdown).await {
                break;
            }
        }
    }

    async fn bootstrap(&self, client: &CollectorClient) {
        log::info!(
            "Fetching the current snippet for team '{}' from {}",
            self.team,
            client.base_url()
        );
        match client.get_authorized_keys(&self.team).await {
            Ok(snippet) => {
                self.writer.apply_logged(snippet).await;
            }
            Err(err) => log::warn!("Bootstrap fetch failed, ignoring: {err}"),
        }
    }

    async fn run_poll(&self, client: &CollectorClient, mut shutdown: watch::Receiver<bool>) {
        let mut synced = false;
        loop {
            let fetched = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => return,
                fetched = async {
                    if synced {
                        client.poll_for_keys(&self.team).await
                    } else {
                        client.get_keys(&self.team).await.map(PollOutcome::Keys)
                    }
                } => fetched,
            };

            match fetched {
                Ok(PollOutcome::Keys(records)) => {
                    synced = true;
                    match render(&records) {
                        Ok(snippet) => {
                            self.writer.apply_logged(snippet).await;
                        }
                        Err(err) => log::error!("Cannot render keys of team '{}': {err}", self.team),
                    }
                }
                Ok(PollOutcome::TimedOut) => {
                    log::debug!("Long poll for team '{}' timed out, polling again", self.team);
                }
                Err(err) => {
                    log::error!("Polling collector for team '{}' failed: {err}", self.team);
                    synced = false;
                    if !self.recover(&mut shutdown).await {
                        return;
                    }
                }
            }
        }
    }

    /// Sleeps the recovery interval. Returns `false` when shutdown cut the
    /// wait short.
    async fn recover(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if is_shutting_down(shutdown) {
            return false;
        }
        log::info!(
            "Waiting {:?} before trying to establish a connection again",
            self.recover_interval
        );
        tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown) => false,
            _ = tokio::time::sleep(self.recover_interval) => true,
        }
    }
}
