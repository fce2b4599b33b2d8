use thiserror::Error;

pub type Result<T> = std::result::Result<T, DirectoryError>;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("team '{team}' was not found in organization '{org}'")]
    TeamNotFound { org: String, team: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("directory service rejected credentials: {0}")]
    Unauthorized(String),

    /// Upstream is unavailable or throttling; the next attempt may succeed
    #[error("directory service unavailable: {0}")]
    Transient(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DirectoryError {
    /// Whether retrying without a configuration change can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Http(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TeamNotFound { .. } | Self::NotFound(_))
    }
}
