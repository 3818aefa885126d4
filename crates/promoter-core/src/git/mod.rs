//! Git metadata resolution.
//!
//! The promoter never writes to git directly: it resolves branch heads,
//! reads commit metadata and reads the `hydrator.metadata` file a hydrator
//! leaves on every hydrated commit. Writes happen through pull requests on
//! the SCM.

pub mod cli;
pub mod paths;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::CommitShaState;
use crate::scm::RepoRef;

pub use cli::{CliGit, GitRemote};
pub use paths::GitPaths;

/// File a hydrator writes at the root of every hydrated commit.
pub const HYDRATOR_METADATA_FILE: &str = "hydrator.metadata";

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// Repository, branch or object does not exist on the remote.
    #[error("not found: {0}")]
    NotFound(String),

    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// Connection failure or timeout.
    #[error("network error: {0}")]
    Network(String),

    /// Any other git failure.
    #[error("git command failed: {0}")]
    Command(String),
}

impl GitError {
    /// Network trouble and unclassified command failures (lock files,
    /// interrupted fetches) clear up on their own; auth and not-found do not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GitError::Network(_) | GitError::Command(_))
    }
}

/// Metadata of one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMetadata {
    pub sha: String,
    pub author: String,
    pub subject: String,
    pub body: String,
    pub commit_time: Option<DateTime<Utc>>,
}

/// Contents of `hydrator.metadata`: the dry commit a hydrated commit was
/// rendered from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HydratorMetadata {
    pub dry_sha: String,
    #[serde(rename = "repoURL", default)]
    pub repo_url: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

/// Read-only git access against one remote.
#[async_trait]
pub trait GitOperations: Send + Sync {
    /// Resolve branch heads. Branches that do not exist are omitted from the
    /// result rather than reported as errors.
    async fn ls_remote(
        &self,
        repo: &RepoRef,
        branches: &[String],
    ) -> Result<HashMap<String, String>, GitError>;

    async fn read_commit(
        &self,
        repo: &RepoRef,
        branch: &str,
        sha: &str,
    ) -> Result<CommitMetadata, GitError>;

    /// `Ok(None)` when the commit carries no (parseable) hydrator metadata.
    async fn read_hydrator_metadata(
        &self,
        repo: &RepoRef,
        branch: &str,
        sha: &str,
    ) -> Result<Option<HydratorMetadata>, GitError>;
}

/// Hydrated and dry view of the commit at `sha` on `branch`.
pub async fn describe_commit(
    git: &dyn GitOperations,
    repo: &RepoRef,
    branch: &str,
    sha: &str,
) -> Result<(CommitShaState, CommitShaState), GitError> {
    let commit = git.read_commit(repo, branch, sha).await?;
    let hydrated = CommitShaState {
        sha: commit.sha,
        author: commit.author,
        subject: commit.subject,
        body: commit.body,
        commit_time: commit.commit_time,
        repo_url: String::new(),
    };
    let dry = match git.read_hydrator_metadata(repo, branch, sha).await? {
        Some(meta) => CommitShaState {
            sha: meta.dry_sha,
            author: meta.author,
            subject: meta.subject,
            body: meta.body,
            commit_time: meta.date,
            repo_url: meta.repo_url,
        },
        None => CommitShaState::default(),
    };
    Ok((hydrated, dry))
}
