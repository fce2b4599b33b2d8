use crate::cache::MembershipCache;
use crate::shutdown::wait_for_shutdown;
use sshkey_transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Periodically pulls every configured team through the cache and publishes
/// the current snippet on the team's channel. Unchanged snippets are
/// republished too, so subscribers that missed a message catch up.
pub struct Collector {
    cache: Arc<MembershipCache>,
    teams: Vec<String>,
    interval: Duration,
    publishers: HashMap<String, Arc<dyn Transport>>,
    /// Generation last published per team
    published: HashMap<String, u64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub refreshed: usize,
    pub published: usize,
    pub failed: usize,
}

impl Collector {
    pub fn new(cache: Arc<MembershipCache>, teams: Vec<String>, interval: Duration) -> Self {
        Self {
            cache,
            teams,
            interval,
            publishers: HashMap::new(),
            published: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_publisher(mut self, team: &str, transport: Arc<dyn Transport>) -> Self {
        self.publishers.insert(team.to_string(), transport);
        self
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "Collecting {} team(s) every {:?}",
            self.teams.len(),
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }
            let report = self.collect_once().await;
            log::debug!("Collection cycle finished: {report:?}");
        }
        log::info!("Collector stopped");
    }

    /// One pass over all teams. Failures are logged; the next cycle retries.
    pub async fn collect_once(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        for team in &self.teams {
            let payload = match self.cache.get(team).await {
                Ok(payload) => payload,
                Err(err) => {
                    log::error!("Collecting team '{team}' failed: {err}");
                    report.failed += 1;
                    continue;
                }
            };
            report.refreshed += 1;

            let Some(transport) = self.publishers.get(team) else {
                continue;
            };
            if self.published.get(team) == Some(&payload.generation) {
                log::debug!("Team '{team}' has not changed, publishing anyway");
            }
            match transport.publish(&payload.snippet).await {
                Ok(receivers) => {
                    log::debug!("Published team '{team}' to {receivers} subscriber(s)");
                    self.published.insert(team.clone(), payload.generation);
                    report.published += 1;
                }
                Err(err) => {
                    log::error!("Publishing snippet for team '{team}' failed: {err}");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
