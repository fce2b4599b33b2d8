use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Display name used when the directory service has none for a user.
pub const UNKNOWN_NAME: &str = "unknown name";

pub const ERROR_INVALID_TEAM: &str = "invalid team value";
pub const ERROR_INVALID_INIT: &str = "invalid init value";
pub const ERROR_INVALID_TIMEOUT: &str = "invalid timeout value";
pub const ERROR_METHOD_NOT_ALLOWED: &str = "method not allowed";
pub const ERROR_TEAM_NOT_FOUND: &str = "team not found";
pub const ERROR_NOT_FOUND: &str = "not found";
pub const ERROR_UNEXPECTED: &str = "unexpected error occurred";

/// Body of a long-poll request that saw no update before its deadline. It is
/// sent with `200 OK` so clients can tell "poll again" apart from failures.
pub const ERROR_LONGPOLL_TIMEOUT: &str = "long polling has timed out";

fn unknown_name() -> String {
    UNKNOWN_NAME.to_string()
}

/// A single member of a team, as returned by the directory service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub login: String,
    pub id: u64,
    #[serde(rename = "name", default = "unknown_name")]
    pub display_name: String,
    #[serde(default)]
    pub keys: String,
}

impl UserRecord {
    pub fn new(login: impl Into<String>, id: u64) -> Self {
        Self {
            login: login.into(),
            id,
            display_name: unknown_name(),
            keys: String::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    #[must_use]
    pub fn with_keys(mut self, keys: impl Into<String>) -> Self {
        self.keys = keys.into();
        self
    }

    /// The name to show in rendered output, never empty.
    pub fn name_or_placeholder(&self) -> &str {
        let name = self.display_name.trim();
        if name.is_empty() {
            UNKNOWN_NAME
        } else {
            name
        }
    }
}

/// Team members in directory-service order. Order is preserved through
/// serialization and rendering.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct UserRecordList(pub Vec<UserRecord>);

impl UserRecordList {
    pub fn iter(&self) -> std::slice::Iter<'_, UserRecord> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<UserRecord>> for UserRecordList {
    fn from(records: Vec<UserRecord>) -> Self {
        Self(records)
    }
}

impl<'a> IntoIterator for &'a UserRecordList {
    type Item = &'a UserRecord;
    type IntoIter = std::slice::Iter<'a, UserRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// `GET /keys` response body.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct KeysBody {
    pub keys: UserRecordList,
}

/// `GET /authorized_keys` response body.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AuthorizedKeysBody {
    pub authorized_keys: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    pub fn is_longpoll_timeout(&self) -> bool {
        self.error == ERROR_LONGPOLL_TIMEOUT
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StatusBody {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,
}

pub fn serialize_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(Into::into)
}
