//! Directory-service access: which users belong to a team, and which public
//! SSH keys they have.

mod error;
mod github;

pub use error::{DirectoryError, Result};
pub use github::{GitHubConfig, GitHubDirectory, DEFAULT_API_URL, DEFAULT_KEYS_URL};

use async_trait::async_trait;
use sshkey_protocol::UserRecordList;

#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Resolves a team name (or slug) within `org` to its numeric id.
    ///
    /// Fails with [`DirectoryError::TeamNotFound`] when the organization has
    /// no such team.
    async fn resolve_team_id(&self, org: &str, team: &str) -> Result<u64>;

    /// Lists the members of a team together with their public keys, in
    /// directory order.
    async fn list_team_members_with_keys(&self, team_id: u64) -> Result<UserRecordList>;
}
