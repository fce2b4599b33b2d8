#![allow(dead_code)]

use async_trait::async_trait;
use sshkey_directory::{DirectoryClient, DirectoryError};
use sshkey_protocol::{StatusBody, UserRecord, UserRecordList};
use sshkey_provider::cache::{CacheConfig, MembershipCache};
use sshkey_provider::server::{self, spawn_dispatcher, ServerState, Waiters};
use sshkey_provider::shutdown::Shutdown;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Directory with mutable rosters: team name → (id, members).
#[derive(Default)]
pub struct FakeDirectory {
    teams: Mutex<HashMap<String, (u64, Vec<UserRecord>)>>,
    pub list_calls: AtomicUsize,
}

impl FakeDirectory {
    pub fn set_team(&self, team: &str, id: u64, members: Vec<UserRecord>) {
        self.teams
            .lock()
            .unwrap()
            .insert(team.to_string(), (id, members));
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectoryClient for FakeDirectory {
    async fn resolve_team_id(&self, org: &str, team: &str) -> sshkey_directory::Result<u64> {
        self.teams
            .lock()
            .unwrap()
            .get(team)
            .map(|(id, _)| *id)
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
        let teams = self.teams.lock().unwrap();
        teams
            .values()
            .find(|(id, _)| *id == team_id)
            .map(|(_, members)| members.clone().into())
            .ok_or_else(|| DirectoryError::NotFound(format!("team {team_id}")))
    }
}

pub fn member(login: &str, id: u64) -> UserRecord {
    UserRecord::new(login, id).with_keys(format!("ssh-ed25519 AAAA{login}"))
}

/// A collector HTTP server on a loopback port, without the ticker.
pub struct TestCollector {
    pub base_url: String,
    pub directory: Arc<FakeDirectory>,
    pub cache: Arc<MembershipCache>,
    pub waiters: Arc<Waiters>,
    pub shutdown: Shutdown,
}

impl TestCollector {
    pub async fn start(ttl: Duration) -> Self {
        let directory = Arc::new(FakeDirectory::default());
        directory.set_team("x", 1, vec![member("alice", 10)]);
        directory.set_team("y", 2, vec![member("yusuf", 20)]);

        let (cache, updates) = MembershipCache::new(
            directory.clone(),
            CacheConfig {
                organization: "acme".to_string(),
                ttl,
            },
        );
        let cache = Arc::new(cache);
        let waiters = Arc::new(Waiters::default());
        spawn_dispatcher(updates, waiters.clone());

        let shutdown = Shutdown::new();
        let state = Arc::new(ServerState {
            cache: cache.clone(),
            waiters: waiters.clone(),
            status: StatusBody {
                status: "ok".to_string(),
                image: Some("sshkey-provider:test".to_string()),
                git_sha: None,
            },
            default_timeout: Duration::from_secs(120),
            shutdown: shutdown.subscribe(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let base_url = format!("http://{}", listener.local_addr().expect("addr"));
        let server_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let _ = server::serve(listener, state, server_shutdown).await;
        });

        Self {
            base_url,
            directory,
            cache,
            waiters,
            shutdown,
        }
    }

    /// Replaces the roster of `team` and forces a cache refresh once the
    /// current entry has expired.
    pub async fn change_team(&self, team: &str, id: u64, members: Vec<UserRecord>, ttl: Duration) {
        self.directory.set_team(team, id, members);
        tokio::time::sleep(ttl + Duration::from_millis(20)).await;
        self.cache.get(team).await.expect("refresh");
    }

    pub async fn wait_for_waiters(&self, team: &str, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.waiters.count(team) < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no long-poll client parked for team '{team}'"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub async fn get_json(url: &str) -> (u16, serde_json::Value) {
    let response = reqwest::get(url).await.expect("request");
    let status = response.status().as_u16();
    let bytes = response.bytes().await.expect("body");
    (status, serde_json::from_slice(&bytes).expect("json body"))
}
