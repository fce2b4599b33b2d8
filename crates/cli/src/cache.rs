use sshkey_authorized_keys::{render, AuthorizedKeysError};
use sshkey_directory::{DirectoryClient, DirectoryError};
use sshkey_protocol::{KeysBody, UserRecordList};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Capacity of the "team refreshed" notification queue. Notifications that
/// do not fit are dropped.
pub const NOTIFY_CAPACITY: usize = 5;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub organization: String,
    pub ttl: Duration,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Upstream(#[from] DirectoryError),

    #[error("failed to render snippet for team '{team}': {source}")]
    Render {
        team: String,
        #[source]
        source: AuthorizedKeysError,
    },

    #[error("failed to encode keys for team '{team}': {source}")]
    Encode {
        team: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    pub fn is_team_not_found(&self) -> bool {
        matches!(self, Self::Upstream(err) if err.is_not_found())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Everything the collector serves for one team, rendered once per refresh.
#[derive(Debug, PartialEq, Eq)]
pub struct TeamPayload {
    pub team: String,
    pub records: UserRecordList,
    /// Encoded `GET /keys` body
    pub keys_json: String,
    pub snippet: String,
    /// Bumped whenever the member list changes
    pub generation: u64,
}

impl TeamPayload {
    fn build(team: &str, records: UserRecordList, generation: u64) -> Result<Self> {
        let snippet = render(&records).map_err(|source| CacheError::Render {
            team: team.to_string(),
            source,
        })?;
        let body = KeysBody { keys: records };
        let keys_json = serde_json::to_string(&body).map_err(|source| CacheError::Encode {
            team: team.to_string(),
            source,
        })?;
        Ok(Self {
            team: team.to_string(),
            records: body.keys,
            keys_json,
            snippet,
            generation,
        })
    }
}

#[derive(Default)]
struct CacheEntry {
    team_id: Option<u64>,
    payload: Option<Arc<TeamPayload>>,
    updated_at: Option<Instant>,
}

/// Per-team membership cache with TTL expiry.
///
/// Concurrent `get`s for a stale team collapse into one upstream fetch: the
/// first caller refreshes under the team's refresh lock, the rest wait on the
/// lock and then find the entry fresh.
pub struct MembershipCache {
    directory: Arc<dyn DirectoryClient>,
    config: CacheConfig,
    entries: RwLock<HashMap<String, CacheEntry>>,
    refresh_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    notify_tx: mpsc::Sender<String>,
}

impl MembershipCache {
    /// Returns the cache and the receiving end of its refresh notifications.
    pub fn new(
        directory: Arc<dyn DirectoryClient>,
        config: CacheConfig,
    ) -> (Self, mpsc::Receiver<String>) {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_CAPACITY);
        let cache = Self {
            directory,
            config,
            entries: RwLock::new(HashMap::new()),
            refresh_locks: StdMutex::new(HashMap::new()),
            notify_tx,
        };
        (cache, notify_rx)
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    pub async fn get(&self, team: &str) -> Result<Arc<TeamPayload>> {
        if let Some(payload) = self.fresh(team) {
            return Ok(payload);
        }

        let lock = self.refresh_lock(team);
        let _guard = lock.lock().await;
        if let Some(payload) = self.fresh(team) {
            log::debug!("Team '{team}' was refreshed while waiting, using cached payload");
            return Ok(payload);
        }
        self.refresh(team).await
    }

    fn fresh(&self, team: &str) -> Option<Arc<TeamPayload>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(team)?;
        let updated_at = entry.updated_at?;
        if updated_at.elapsed() < self.config.ttl {
            entry.payload.clone()
        } else {
            None
        }
    }

    fn refresh_lock(&self, team: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(team.to_string()).or_default().clone()
    }

    /// Caller must hold the team's refresh lock.
    async fn refresh(&self, team: &str) -> Result<Arc<TeamPayload>> {
        let (known_id, previous) = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries
                .get(team)
                .map(|entry| (entry.team_id, entry.payload.clone()))
                .unwrap_or_default()
        };

        let team_id = match known_id {
            Some(id) => id,
            None => {
                let id = self
                    .directory
                    .resolve_team_id(&self.config.organization, team)
                    .await?;
                log::info!(
                    "Resolved team '{team}' in '{}' to id {id}",
                    self.config.organization
                );
                self.entries
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(team.to_string())
                    .or_default()
                    .team_id = Some(id);
                id
            }
        };

        let records = self.directory.list_team_members_with_keys(team_id).await?;
        let payload = match previous {
            Some(previous) if previous.records == records => previous,
            previous => {
                let generation = previous.map_or(1, |p| p.generation + 1);
                let payload = Arc::new(TeamPayload::build(team, records, generation)?);
                log::info!(
                    "Team '{team}' membership changed: {} member(s) with keys, generation {generation}",
                    payload.records.len()
                );
                payload
            }
        };

        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let entry = entries.entry(team.to_string()).or_default();
            entry.payload = Some(payload.clone());
            entry.updated_at = Some(Instant::now());
        }

        match self.notify_tx.try_send(team.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::debug!("Notification queue full, dropping refresh of '{team}'")
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("No notification listener, dropping refresh of '{team}'")
            }
        }
        Ok(payload)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::future::join_all;
    use sshkey_protocol::UserRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory directory with call counters and an optional delay.
    pub(crate) struct FakeDirectory {
        pub teams: StdMutex<HashMap<String, u64>>,
        pub members: StdMutex<HashMap<u64, UserRecordList>>,
        pub outage: std::sync::atomic::AtomicBool,
        pub delay: Duration,
        pub resolve_calls: AtomicUsize,
        pub list_calls: AtomicUsize,
    }

    impl FakeDirectory {
        pub fn new(delay: Duration) -> Self {
            Self {
                teams: StdMutex::new(HashMap::new()),
                members: StdMutex::new(HashMap::new()),
                outage: std::sync::atomic::AtomicBool::new(false),
                delay,
                resolve_calls: AtomicUsize::new(0),
                list_calls: AtomicUsize::new(0),
            }
        }

        pub fn with_team(self, name: &str, id: u64, records: Vec<UserRecord>) -> Self {
            self.teams.lock().unwrap().insert(name.to_string(), id);
            self.set_members(id, records);
            self
        }

        pub fn set_members(&self, id: u64, records: Vec<UserRecord>) {
            self.members.lock().unwrap().insert(id, records.into());
        }
    }

    #[async_trait]
    impl DirectoryClient for FakeDirectory {
        async fn resolve_team_id(&self, org: &str, team: &str) -> sshkey_directory::Result<u64> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.teams
                .lock()
                .unwrap()
                .get(team)
                .copied()
                .ok_or_else(|| DirectoryError::TeamNotFound {
                    org: org.to_string(),
                    team: team.to_string(),
                })
        }

        async fn list_team_members_with_keys(
            &self,
            team_id: u64,
        ) -> sshkey_directory::Result<UserRecordList> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.outage.load(Ordering::SeqCst) {
                return Err(DirectoryError::Transient("upstream returned 502".into()));
            }
            Ok(self
                .members
                .lock()
                .unwrap()
                .get(&team_id)
                .cloned()
                .unwrap_or_default())
        }
    }

    fn alice() -> UserRecord {
        UserRecord::new("alice", 1)
            .with_name("Alice")
            .with_keys("ssh-ed25519 AAAAalice")
    }

    fn cache_over(
        directory: Arc<FakeDirectory>,
        ttl: Duration,
    ) -> (Arc<MembershipCache>, mpsc::Receiver<String>) {
        let (cache, rx) = MembershipCache::new(
            directory,
            CacheConfig {
                organization: "acme".to_string(),
                ttl,
            },
        );
        (Arc::new(cache), rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cold_gets_share_one_fetch() {
        let directory = Arc::new(
            FakeDirectory::new(Duration::from_millis(50)).with_team("sre", 42, vec![alice()]),
        );
        let (cache, _rx) = cache_over(directory.clone(), Duration::from_secs(60));

        let tasks = (0..50).map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("sre").await })
        });
        let results = join_all(tasks).await;

        let first = results[0].as_ref().unwrap().as_ref().unwrap().clone();
        for result in &results {
            let payload = result.as_ref().unwrap().as_ref().unwrap();
            assert!(Arc::ptr_eq(payload, &first));
        }
        assert_eq!(directory.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(directory.resolve_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let directory =
            Arc::new(FakeDirectory::new(Duration::ZERO).with_team("sre", 42, vec![alice()]));
        let (cache, _rx) = cache_over(directory.clone(), Duration::from_secs(30));

        cache.get("sre").await.unwrap();
        tokio::time::advance(Duration::from_secs(29)).await;
        cache.get("sre").await.unwrap();
        assert_eq!(directory.list_calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.get("sre").await.unwrap();
        assert_eq!(directory.list_calls.load(Ordering::SeqCst), 2);
        // the id is resolved once and reused
        assert_eq!(directory.resolve_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn generation_moves_only_on_membership_change() {
        let directory =
            Arc::new(FakeDirectory::new(Duration::ZERO).with_team("sre", 42, vec![alice()]));
        let (cache, _rx) = cache_over(directory.clone(), Duration::from_secs(10));

        let first = cache.get("sre").await.unwrap();
        assert_eq!(first.generation, 1);
        assert!(first.snippet.contains("# SSH keys for alice (Alice)"));
        assert!(first.keys_json.starts_with(r#"{"keys":[{"login":"alice""#));

        tokio::time::advance(Duration::from_secs(11)).await;
        let same = cache.get("sre").await.unwrap();
        assert!(Arc::ptr_eq(&first, &same));

        directory.set_members(42, vec![alice(), UserRecord::new("bob", 2).with_keys("ssh-rsa B")]);
        tokio::time::advance(Duration::from_secs(11)).await;
        let changed = cache.get("sre").await.unwrap();
        assert_eq!(changed.generation, 2);
        assert_eq!(changed.records.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_failure_keeps_previous_payload() {
        let directory =
            Arc::new(FakeDirectory::new(Duration::ZERO).with_team("sre", 42, vec![alice()]));
        let (cache, _rx) = cache_over(directory.clone(), Duration::from_secs(10));

        let before = cache.get("sre").await.unwrap();

        directory.outage.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(11)).await;
        let err = cache.get("sre").await.unwrap_err();
        assert!(matches!(err, CacheError::Upstream(DirectoryError::Transient(_))));
        assert!(!err.is_team_not_found());

        directory.outage.store(false, Ordering::SeqCst);
        let after = cache.get("sre").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn unknown_team_is_reported() {
        let directory = Arc::new(FakeDirectory::new(Duration::ZERO));
        let (cache, _rx) = cache_over(directory, Duration::from_secs(10));

        let err = cache.get("ghosts").await.unwrap_err();
        assert!(err.is_team_not_found(), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_notify_without_blocking() {
        let directory =
            Arc::new(FakeDirectory::new(Duration::ZERO).with_team("sre", 42, vec![alice()]));
        let (cache, mut rx) = cache_over(directory.clone(), Duration::from_secs(1));

        for _ in 0..(NOTIFY_CAPACITY + 3) {
            cache.get("sre").await.unwrap();
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        assert_eq!(directory.list_calls.load(Ordering::SeqCst), NOTIFY_CAPACITY + 3);

        let mut received = 0;
        while let Ok(team) = rx.try_recv() {
            assert_eq!(team, "sre");
            received += 1;
        }
        assert_eq!(received, NOTIFY_CAPACITY);
    }

    #[tokio::test]
    async fn marker_in_keys_fails_render() {
        let directory = Arc::new(FakeDirectory::new(Duration::ZERO).with_team(
            "sre",
            42,
            vec![UserRecord::new("mallory", 6).with_keys(sshkey_authorized_keys::END_MARKER)],
        ));
        let (cache, _rx) = cache_over(directory, Duration::from_secs(10));

        let err = cache.get("sre").await.unwrap_err();
        assert!(matches!(err, CacheError::Render { ref team, .. } if team == "sre"));
    }
}
