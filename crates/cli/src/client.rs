use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sshkey_protocol::{AuthorizedKeysBody, ErrorBody, KeysBody, UserRecordList};
use std::time::Duration;
use thiserror::Error;

/// Slack on top of the server-side long-poll timeout before the HTTP request
/// itself is abandoned.
const POLL_GRACE: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("collector request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid collector response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("collector answered {status}: {message}")]
    Status { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Keys(UserRecordList),
    TimedOut,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KeysReply {
    Keys(KeysBody),
    Error(ErrorBody),
}

/// HTTP client for a collector's `/keys` and `/authorized_keys`.
#[derive(Clone)]
pub struct CollectorClient {
    http: reqwest::Client,
    base_url: String,
    poll_timeout: Duration,
}

impl CollectorClient {
    pub fn new(base_url: &str, poll_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("sshkey-provider/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Current keys of `team`, without waiting for an update.
    pub async fn get_keys(&self, team: &str) -> Result<UserRecordList> {
        let reply: KeysReply = self
            .get_json("/keys", &[("team", team), ("init", "true")], REQUEST_TIMEOUT)
            .await?;
        match reply {
            KeysReply::Keys(body) => Ok(body.keys),
            KeysReply::Error(body) => Err(ClientError::Status {
                status: StatusCode::OK.as_u16(),
                message: body.error,
            }),
        }
    }

    /// Waits for the next update of `team`, up to the configured poll timeout.
    pub async fn poll_for_keys(&self, team: &str) -> Result<PollOutcome> {
        let timeout = self.poll_timeout.as_secs().to_string();
        let reply: KeysReply = self
            .get_json(
                "/keys",
                &[("team", team), ("init", "false"), ("timeout", timeout.as_str())],
                self.poll_timeout + POLL_GRACE,
            )
            .await?;
        match reply {
            KeysReply::Keys(body) => Ok(PollOutcome::Keys(body.keys)),
            KeysReply::Error(body) if body.is_longpoll_timeout() => Ok(PollOutcome::TimedOut),
            KeysReply::Error(body) => Err(ClientError::Status {
                status: StatusCode::OK.as_u16(),
                message: body.error,
            }),
        }
    }

    /// Rendered snippet of `team`.
    pub async fn get_authorized_keys(&self, team: &str) -> Result<String> {
        let body: AuthorizedKeysBody = self
            .get_json("/authorized_keys", &[("team", team)], REQUEST_TIMEOUT)
            .await?;
        Ok(body.authorized_keys)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(query)
            .timeout(timeout)
            .send()
            .await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorBody>(&bytes)
                .map(|body| body.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).trim().to_string());
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}
