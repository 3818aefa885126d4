//! GitHub REST v3 pull request client.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{check_response, PullRequestRequest, RepoRef, ScmError, ScmPullRequest};
use crate::api::PullRequestState;
use crate::git::GitOperations;

pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    git: Arc<dyn GitOperations>,
}

#[derive(Debug, Deserialize)]
struct GhRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhPull {
    number: u64,
    state: String,
    #[serde(default)]
    merged: bool,
    #[serde(default)]
    merged_at: Option<DateTime<Utc>>,
    html_url: String,
    #[serde(default)]
    mergeable: Option<bool>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    head: GhRef,
}

impl From<GhPull> for ScmPullRequest {
    fn from(pr: GhPull) -> Self {
        let state = if pr.merged || pr.merged_at.is_some() {
            PullRequestState::Merged
        } else if pr.state == "open" {
            PullRequestState::Open
        } else {
            PullRequestState::Closed
        };
        ScmPullRequest {
            id: pr.number.to_string(),
            state,
            url: pr.html_url,
            mergeable: pr.mergeable,
            created_at: pr.created_at,
            head_sha: Some(pr.head.sha),
        }
    }
}

impl GitHubClient {
    /// `domain` of `github.com` talks to api.github.com; anything else is
    /// treated as GitHub Enterprise at `https://{domain}/api/v3`.
    pub fn new(
        http: reqwest::Client,
        domain: &str,
        token: &str,
        git: Arc<dyn GitOperations>,
    ) -> Self {
        let api_base = if domain == "github.com" {
            "https://api.github.com".to_string()
        } else {
            format!("https://{domain}/api/v3")
        };
        Self::with_api_base(http, api_base, token, git)
    }

    pub fn with_api_base(
        http: reqwest::Client,
        api_base: impl Into<String>,
        token: &str,
        git: Arc<dyn GitOperations>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.to_string(),
            git,
        }
    }

    pub fn git(&self) -> Arc<dyn GitOperations> {
        Arc::clone(&self.git)
    }

    fn pulls_url(&self, repo: &RepoRef) -> String {
        format!("{}/repos/{}/{}/pulls", self.api_base, repo.owner, repo.name)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ScmError> {
        let response = request
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await?;
        check_response(response).await
    }

    pub async fn create_pull_request(
        &self,
        repo: &RepoRef,
        request: &PullRequestRequest,
    ) -> Result<ScmPullRequest, ScmError> {
        let body = json!({
            "title": request.title,
            "body": request.description,
            "head": request.source_branch,
            "base": request.target_branch,
        });
        let pr: GhPull = self
            .send(self.http.post(self.pulls_url(repo)).json(&body))
            .await?
            .json()
            .await?;
        Ok(pr.into())
    }

    pub async fn update_pull_request(
        &self,
        repo: &RepoRef,
        id: &str,
        request: &PullRequestRequest,
    ) -> Result<(), ScmError> {
        let body = json!({ "title": request.title, "body": request.description });
        self.send(
            self.http
                .patch(format!("{}/{id}", self.pulls_url(repo)))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    pub async fn merge_pull_request(
        &self,
        repo: &RepoRef,
        id: &str,
        head_sha: &str,
    ) -> Result<(), ScmError> {
        let body = json!({ "merge_method": "merge", "sha": head_sha });
        self.send(
            self.http
                .put(format!("{}/{id}/merge", self.pulls_url(repo)))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    pub async fn close_pull_request(&self, repo: &RepoRef, id: &str) -> Result<(), ScmError> {
        self.send(
            self.http
                .patch(format!("{}/{id}", self.pulls_url(repo)))
                .json(&json!({ "state": "closed" })),
        )
        .await?;
        Ok(())
    }

    pub async fn get_pull_request(
        &self,
        repo: &RepoRef,
        id: &str,
    ) -> Result<ScmPullRequest, ScmError> {
        let pr: GhPull = self
            .send(self.http.get(format!("{}/{id}", self.pulls_url(repo))))
            .await?
            .json()
            .await?;
        Ok(pr.into())
    }

    pub async fn find_open_pull_request(
        &self,
        repo: &RepoRef,
        source: &str,
        target: &str,
    ) -> Result<Option<ScmPullRequest>, ScmError> {
        let head = format!("{}:{source}", repo.owner);
        let pulls: Vec<GhPull> = self
            .send(self.http.get(self.pulls_url(repo)).query(&[
                ("state", "open"),
                ("head", head.as_str()),
                ("base", target),
            ]))
            .await?
            .json()
            .await?;
        Ok(pulls.into_iter().next().map(Into::into))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_state_mapping() {
        let pr: GhPull = serde_json::from_value(json!({
            "number": 42,
            "state": "closed",
            "merged": true,
            "html_url": "https://github.com/argoproj/deployments/pull/42",
            "mergeable": null,
            "created_at": "2024-05-01T10:00:00Z",
            "head": { "sha": "abc123" }
        }))
        .unwrap();
        let pr: ScmPullRequest = pr.into();
        assert_eq!(pr.id, "42");
        assert_eq!(pr.state, PullRequestState::Merged);
        assert_eq!(pr.mergeable, None);
        assert_eq!(pr.head_sha.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_closed_unmerged_pull_is_closed() {
        let pr: GhPull = serde_json::from_value(json!({
            "number": 7,
            "state": "closed",
            "html_url": "https://github.com/a/b/pull/7",
            "head": { "sha": "def456" }
        }))
        .unwrap();
        assert_eq!(ScmPullRequest::from(pr).state, PullRequestState::Closed);
    }
}
