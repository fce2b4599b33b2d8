use crate::{DirectoryClient, DirectoryError, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sshkey_protocol::{UserRecord, UserRecordList};
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_KEYS_URL: &str = "https://github.com";

const USER_AGENT: &str = concat!("sshkey-provider/", env!("CARGO_PKG_VERSION"));
const MAX_PAGES: usize = 100;
const MEMBER_FETCH_CONCURRENCY: usize = 8;

#[derive(Clone, Debug)]
pub struct GitHubConfig {
    /// REST API root, e.g. `https://api.github.com`
    pub api_url: String,
    /// Root serving `/<login>.keys`
    pub keys_url: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
    pub per_page: usize,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            keys_url: DEFAULT_KEYS_URL.to_string(),
            token: None,
            request_timeout: Duration::from_secs(30),
            per_page: 100,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Team {
    id: u64,
    name: String,
    #[serde(default)]
    slug: String,
}

#[derive(Debug, Deserialize)]
struct Member {
    login: String,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct UserDetails {
    #[serde(default)]
    name: Option<String>,
}

/// Directory client backed by the GitHub REST API.
///
/// Keys are read from the public `<login>.keys` endpoint instead of the
/// rate-limited keys API.
#[derive(Clone)]
pub struct GitHubDirectory {
    http: reqwest::Client,
    config: GitHubConfig,
}

impl GitHubDirectory {
    pub fn new(config: GitHubConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    fn api(&self, path: &str) -> String {
        format!("{}{path}", self.config.api_url.trim_end_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut request = self
            .http
            .get(url)
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.config.token {
            request = request.header(AUTHORIZATION, format!("token {token}"));
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        check_status(status, url)?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get_paginated<T: DeserializeOwned>(&self, url: &str) -> Result<Vec<T>> {
        let per_page = self.config.per_page.max(1);
        let separator = if url.contains('?') { '&' } else { '?' };
        let mut items = Vec::new();
        for page in 1..=MAX_PAGES {
            let page_url = format!("{url}{separator}per_page={per_page}&page={page}");
            let batch: Vec<T> = self.get_json(&page_url).await?;
            let done = batch.len() < per_page;
            items.extend(batch);
            if done {
                return Ok(items);
            }
        }
        log::warn!("stopped paginating {url} after {MAX_PAGES} pages");
        Ok(items)
    }

    async fn display_name(&self, member: &Member) -> Option<String> {
        match self
            .get_json::<UserDetails>(&self.api(&format!("/user/{}", member.id)))
            .await
        {
            Ok(details) => details.name.filter(|n| !n.trim().is_empty()),
            Err(err) => {
                log::info!("Could not fetch details for user '{}': {err}", member.login);
                None
            }
        }
    }

    async fn public_keys(&self, login: &str) -> Result<String> {
        let url = format!(
            "{}/{login}.keys",
            self.config.keys_url.trim_end_matches('/')
        );
        log::debug!("Fetching keys for user '{login}'");
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        check_status(status, &url)?;
        Ok(body.trim().to_string())
    }

    /// `Ok(None)` when the member has no usable keys. Any other failure
    /// aborts the listing so a partial roster is never reported.
    async fn member_record(&self, member: Member) -> Result<Option<UserRecord>> {
        let name = self.display_name(&member).await;
        let keys = match self.public_keys(&member.login).await {
            Ok(keys) => keys,
            Err(err) if err.is_not_found() => {
                log::info!("Could not fetch keys for user '{}': {err}", member.login);
                String::new()
            }
            Err(err) => {
                log::warn!("Fetching keys for user '{}' failed: {err}", member.login);
                return Err(err);
            }
        };
        if keys.is_empty() {
            log::info!("No public SSH keys for user '{}'", member.login);
            return Ok(None);
        }

        let mut record = UserRecord::new(member.login, member.id).with_keys(keys);
        if let Some(name) = name {
            record = record.with_name(name);
        }
        Ok(Some(record))
    }
}

#[async_trait]
impl DirectoryClient for GitHubDirectory {
    async fn resolve_team_id(&self, org: &str, team: &str) -> Result<u64> {
        log::debug!("Fetching list of teams for organization '{org}'");
        let teams: Vec<Team> = self
            .get_paginated(&self.api(&format!("/orgs/{org}/teams")))
            .await?;
        let found = teams
            .into_iter()
            .find(|t| t.name == team || (!t.slug.is_empty() && t.slug == team))
            .ok_or_else(|| DirectoryError::TeamNotFound {
                org: org.to_string(),
                team: team.to_string(),
            })?;
        log::debug!(
            "Team '{team}' with id {} found in organization '{org}'",
            found.id
        );
        Ok(found.id)
    }

    async fn list_team_members_with_keys(&self, team_id: u64) -> Result<UserRecordList> {
        log::debug!("Fetching a list of users in team with ID {team_id}");
        let members: Vec<Member> = self
            .get_paginated(&self.api(&format!("/teams/{team_id}/members?role=all")))
            .await?;

        // `buffered` keeps directory order while fetching members concurrently.
        let fetched: Vec<Option<UserRecord>> = stream::iter(members)
            .map(|member| self.member_record(member))
            .buffered(MEMBER_FETCH_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(UserRecordList(fetched.into_iter().flatten().collect()))
    }
}

fn check_status(status: StatusCode, url: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let detail = format!("{url} returned {status}");
    Err(match status {
        StatusCode::NOT_FOUND => DirectoryError::NotFound(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DirectoryError::Unauthorized(detail),
        _ => DirectoryError::Transient(detail),
    })
}
