use std::path::PathBuf;
use thiserror::Error;

/// Result type for authorized_keys operations
pub type Result<T> = std::result::Result<T, AuthorizedKeysError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// A begin marker appeared inside an open managed block
    NestedBegin,
    /// An end marker appeared with no open managed block
    UnmatchedEnd,
}

impl std::fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NestedBegin => f.write_str("begin marker inside a managed block"),
            Self::UnmatchedEnd => f.write_str("end marker without a begin marker"),
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthorizedKeysError {
    /// The target file has unbalanced markers; it is left untouched
    #[error("authorized_keys file is malformed at line {line}: {reason}")]
    Malformed { line: usize, reason: MalformedReason },

    /// A user record would have produced a marker line inside the snippet
    #[error("key material for '{login}' contains a managed block marker")]
    MarkerInContent { login: String },

    #[error("invalid snippet: {0}")]
    InvalidSnippet(String),

    #[error("authorized_keys file does not exist: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("invalid authorized_keys path: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("failed to format snippet")]
    Render(#[from] std::fmt::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthorizedKeysError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}
