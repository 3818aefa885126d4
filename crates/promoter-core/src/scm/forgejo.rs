//! Forgejo / Gitea v1 pull request client.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{check_response, PullRequestRequest, RepoRef, ScmError, ScmPullRequest};
use crate::api::PullRequestState;
use crate::git::GitOperations;

pub struct ForgejoClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    git: Arc<dyn GitOperations>,
}

#[derive(Debug, Deserialize)]
struct Branch {
    #[serde(rename = "ref")]
    name: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct Pull {
    number: u64,
    state: String,
    #[serde(default)]
    merged: bool,
    html_url: String,
    #[serde(default)]
    mergeable: Option<bool>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    head: Branch,
    base: Branch,
}

impl From<Pull> for ScmPullRequest {
    fn from(pr: Pull) -> Self {
        let state = if pr.merged {
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

impl ForgejoClient {
    pub fn new(
        http: reqwest::Client,
        domain: &str,
        token: &str,
        git: Arc<dyn GitOperations>,
    ) -> Self {
        Self {
            http,
            api_base: format!("https://{domain}/api/v1"),
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
            .header("Authorization", format!("token {}", self.token))
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
        let pr: Pull = self
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
        let body = json!({ "Do": "merge", "head_commit_id": head_sha });
        self.send(
            self.http
                .post(format!("{}/{id}/merge", self.pulls_url(repo)))
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
        let pr: Pull = self
            .send(self.http.get(format!("{}/{id}", self.pulls_url(repo))))
            .await?
            .json()
            .await?;
        Ok(pr.into())
    }

    /// The list endpoint cannot filter by branch, so filter client-side.
    pub async fn find_open_pull_request(
        &self,
        repo: &RepoRef,
        source: &str,
        target: &str,
    ) -> Result<Option<ScmPullRequest>, ScmError> {
        let pulls: Vec<Pull> = self
            .send(
                self.http
                    .get(self.pulls_url(repo))
                    .query(&[("state", "open"), ("limit", "50")]),
            )
            .await?
            .json()
            .await?;
        Ok(pulls
            .into_iter()
            .find(|p| p.head.name == source && p.base.name == target)
            .map(Into::into))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_mapping() {
        let pr: Pull = serde_json::from_value(json!({
            "number": 3,
            "state": "open",
            "merged": false,
            "html_url": "https://codeberg.org/acme/deploy/pulls/3",
            "mergeable": true,
            "head": { "ref": "environment/dev-next", "sha": "abc123" },
            "base": { "ref": "environment/dev", "sha": "def456" }
        }))
        .unwrap();
        let pr: ScmPullRequest = pr.into();
        assert_eq!(pr.id, "3");
        assert_eq!(pr.state, PullRequestState::Open);
        assert_eq!(pr.mergeable, Some(true));
    }
}
