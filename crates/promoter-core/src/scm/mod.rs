//! SCM provider integration.
//!
//! The set of providers is closed, so [`ScmClient`] is an enum dispatching on
//! the provider block present in an [`ScmProvider`]. Every variant offers the
//! same pull request capabilities and a [`GitOperations`] handle for the
//! provider's remote.

pub mod fake;
pub mod forgejo;
pub mod github;
pub mod gitlab;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::{PullRequestState, ScmProvider, Secret};
use crate::config::PromoterConfig;
use crate::git::{CliGit, GitOperations, GitPaths, GitRemote};
use crate::metrics::METRICS;

pub use fake::FakeForge;
pub use forgejo::ForgejoClient;
pub use github::GitHubClient;
pub use gitlab::GitLabClient;

/// Owner (or group path) and name of a repository on its provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScmError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("pull request already exists: {0}")]
    AlreadyExists(String),

    #[error("pull request is not mergeable: {0}")]
    NotMergeable(String),

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected response body: {0}")]
    Decode(String),

    #[error("unsupported provider: {0}")]
    Unsupported(String),

    #[error("invalid provider configuration: {0}")]
    Configuration(String),
}

impl ScmError {
    pub fn is_transient(&self) -> bool {
        match self {
            ScmError::RateLimited(_) | ScmError::Network(_) | ScmError::NotMergeable(_) => true,
            ScmError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ScmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ScmError::Decode(err.to_string())
        } else {
            ScmError::Network(err.to_string())
        }
    }
}

/// Desired pull request contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRequest {
    pub title: String,
    pub description: String,
    pub source_branch: String,
    pub target_branch: String,
}

/// A pull request as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScmPullRequest {
    pub id: String,
    pub state: PullRequestState,
    pub url: String,
    /// `None` while the provider is still computing mergeability.
    pub mergeable: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
    pub head_sha: Option<String>,
}

/// Map a non-success HTTP response onto [`ScmError`].
pub(crate) async fn check_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, ScmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let rate_limited = response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "0");
    let message = response.text().await.unwrap_or_default();
    let message = message.chars().take(512).collect::<String>();

    Err(match status.as_u16() {
        401 => ScmError::Auth(message),
        403 if rate_limited => ScmError::RateLimited(message),
        403 => ScmError::Auth(message),
        404 => ScmError::NotFound(message),
        405 | 409 => ScmError::NotMergeable(message),
        422 if message.to_lowercase().contains("already exists") => {
            ScmError::AlreadyExists(message)
        }
        429 => ScmError::RateLimited(message),
        code => ScmError::Api {
            status: code,
            message,
        },
    })
}

/// A provider client with its git remote.
pub enum ScmClient {
    GitHub(GitHubClient),
    GitLab(GitLabClient),
    Forgejo(ForgejoClient),
    Fake(FakeForge),
}

impl ScmClient {
    pub fn provider_name(&self) -> &'static str {
        match self {
            ScmClient::GitHub(_) => "github",
            ScmClient::GitLab(_) => "gitlab",
            ScmClient::Forgejo(_) => "forgejo",
            ScmClient::Fake(_) => "fake",
        }
    }

    pub fn git(&self) -> Arc<dyn GitOperations> {
        match self {
            ScmClient::GitHub(c) => c.git(),
            ScmClient::GitLab(c) => c.git(),
            ScmClient::Forgejo(c) => c.git(),
            ScmClient::Fake(f) => Arc::new(f.clone()),
        }
    }

    pub async fn create_pull_request(
        &self,
        repo: &RepoRef,
        request: &PullRequestRequest,
    ) -> Result<ScmPullRequest, ScmError> {
        METRICS.inc_scm_calls();
        debug!(provider = self.provider_name(), repo = %repo, "create pull request");
        match self {
            ScmClient::GitHub(c) => c.create_pull_request(repo, request).await,
            ScmClient::GitLab(c) => c.create_pull_request(repo, request).await,
            ScmClient::Forgejo(c) => c.create_pull_request(repo, request).await,
            ScmClient::Fake(f) => f.create_pull_request(repo, request),
        }
    }

    pub async fn update_pull_request(
        &self,
        repo: &RepoRef,
        id: &str,
        request: &PullRequestRequest,
    ) -> Result<(), ScmError> {
        METRICS.inc_scm_calls();
        debug!(provider = self.provider_name(), repo = %repo, id, "update pull request");
        match self {
            ScmClient::GitHub(c) => c.update_pull_request(repo, id, request).await,
            ScmClient::GitLab(c) => c.update_pull_request(repo, id, request).await,
            ScmClient::Forgejo(c) => c.update_pull_request(repo, id, request).await,
            ScmClient::Fake(f) => f.update_pull_request(repo, id, request),
        }
    }

    /// Merge pull request `id`, refusing if the source head moved past
    /// `head_sha`.
    pub async fn merge_pull_request(
        &self,
        repo: &RepoRef,
        id: &str,
        head_sha: &str,
    ) -> Result<(), ScmError> {
        METRICS.inc_scm_calls();
        debug!(provider = self.provider_name(), repo = %repo, id, "merge pull request");
        match self {
            ScmClient::GitHub(c) => c.merge_pull_request(repo, id, head_sha).await,
            ScmClient::GitLab(c) => c.merge_pull_request(repo, id, head_sha).await,
            ScmClient::Forgejo(c) => c.merge_pull_request(repo, id, head_sha).await,
            ScmClient::Fake(f) => f.merge_pull_request(repo, id, head_sha),
        }
    }

    pub async fn close_pull_request(&self, repo: &RepoRef, id: &str) -> Result<(), ScmError> {
        METRICS.inc_scm_calls();
        debug!(provider = self.provider_name(), repo = %repo, id, "close pull request");
        match self {
            ScmClient::GitHub(c) => c.close_pull_request(repo, id).await,
            ScmClient::GitLab(c) => c.close_pull_request(repo, id).await,
            ScmClient::Forgejo(c) => c.close_pull_request(repo, id).await,
            ScmClient::Fake(f) => f.close_pull_request(repo, id),
        }
    }

    pub async fn get_pull_request(
        &self,
        repo: &RepoRef,
        id: &str,
    ) -> Result<ScmPullRequest, ScmError> {
        METRICS.inc_scm_calls();
        match self {
            ScmClient::GitHub(c) => c.get_pull_request(repo, id).await,
            ScmClient::GitLab(c) => c.get_pull_request(repo, id).await,
            ScmClient::Forgejo(c) => c.get_pull_request(repo, id).await,
            ScmClient::Fake(f) => f.get_pull_request(repo, id),
        }
    }

    /// The open pull request from `source` into `target`, if the provider
    /// has one.
    pub async fn find_open_pull_request(
        &self,
        repo: &RepoRef,
        source: &str,
        target: &str,
    ) -> Result<Option<ScmPullRequest>, ScmError> {
        METRICS.inc_scm_calls();
        match self {
            ScmClient::GitHub(c) => c.find_open_pull_request(repo, source, target).await,
            ScmClient::GitLab(c) => c.find_open_pull_request(repo, source, target).await,
            ScmClient::Forgejo(c) => c.find_open_pull_request(repo, source, target).await,
            ScmClient::Fake(f) => f.find_open_pull_request(repo, source, target),
        }
    }
}

/// Builds [`ScmClient`]s from provider objects and their credentials.
pub struct ScmResolver {
    http: reqwest::Client,
    fake: FakeForge,
    paths: GitPaths,
    work_dir: PathBuf,
    git_timeout: Duration,
}

impl ScmResolver {
    pub fn new(config: &PromoterConfig, paths: GitPaths) -> Result<Self, ScmError> {
        let http = reqwest::Client::builder()
            .user_agent(config.scm.user_agent.clone())
            .timeout(config.scm.http_timeout())
            .build()
            .map_err(|e| ScmError::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            http,
            fake: FakeForge::new(),
            paths,
            work_dir: config.git.work_dir.clone(),
            git_timeout: config.git.command_timeout(),
        })
    }

    /// Serve `fake` providers from `forge` instead of an empty one.
    pub fn with_fake_forge(mut self, forge: FakeForge) -> Self {
        self.fake = forge;
        self
    }

    pub fn fake_forge(&self) -> &FakeForge {
        &self.fake
    }

    pub fn paths(&self) -> &GitPaths {
        &self.paths
    }

    fn cli_git(&self, remote: GitRemote) -> Arc<dyn GitOperations> {
        Arc::new(CliGit::new(
            remote,
            self.work_dir.clone(),
            self.paths.clone(),
            self.git_timeout,
        ))
    }

    /// Select the backend by the provider block that is present and attach
    /// credentials from `secret`.
    pub fn resolve(&self, provider: &ScmProvider, secret: &Secret) -> Result<ScmClient, ScmError> {
        let spec = &provider.spec;
        let configured = [
            spec.github.is_some(),
            spec.gitlab.is_some(),
            spec.forgejo.is_some(),
            spec.fake.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if configured != 1 {
            return Err(ScmError::Configuration(format!(
                "ScmProvider {} must configure exactly one provider, found {configured}",
                provider.metadata.name
            )));
        }

        if spec.fake.is_some() {
            return Ok(ScmClient::Fake(self.fake.clone()));
        }

        let token = secret.value("token").ok_or_else(|| {
            ScmError::Configuration(format!(
                "Secret {} has no 'token' key",
                secret.metadata.name
            ))
        })?;

        if let Some(github) = &spec.github {
            let domain = github.domain.as_deref().unwrap_or("github.com");
            let git = self.cli_git(GitRemote {
                base_url: format!("https://{domain}"),
                username: Some("x-access-token".to_string()),
                token: Some(token.to_string()),
            });
            return Ok(ScmClient::GitHub(GitHubClient::new(
                self.http.clone(),
                domain,
                token,
                git,
            )));
        }
        if let Some(gitlab) = &spec.gitlab {
            let domain = gitlab.domain.as_deref().unwrap_or("gitlab.com");
            let git = self.cli_git(GitRemote {
                base_url: format!("https://{domain}"),
                username: Some("oauth2".to_string()),
                token: Some(token.to_string()),
            });
            return Ok(ScmClient::GitLab(GitLabClient::new(
                self.http.clone(),
                domain,
                token,
                git,
            )));
        }
        if let Some(forgejo) = &spec.forgejo {
            if forgejo.domain.is_empty() {
                return Err(ScmError::Configuration(format!(
                    "ScmProvider {} forgejo block needs a domain",
                    provider.metadata.name
                )));
            }
            let git = self.cli_git(GitRemote {
                base_url: format!("https://{}", forgejo.domain),
                username: Some(secret.value("username").unwrap_or("git").to_string()),
                token: Some(token.to_string()),
            });
            return Ok(ScmClient::Forgejo(ForgejoClient::new(
                self.http.clone(),
                &forgejo.domain,
                token,
                git,
            )));
        }
        Err(ScmError::Unsupported(provider.metadata.name.clone()))
    }
}
