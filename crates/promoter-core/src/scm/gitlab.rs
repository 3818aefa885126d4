//! GitLab v4 merge request client.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{check_response, PullRequestRequest, RepoRef, ScmError, ScmPullRequest};
use crate::api::PullRequestState;
use crate::git::GitOperations;

pub struct GitLabClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    git: Arc<dyn GitOperations>,
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    iid: u64,
    state: String,
    web_url: String,
    #[serde(default)]
    merge_status: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    sha: Option<String>,
}

impl From<MergeRequest> for ScmPullRequest {
    fn from(mr: MergeRequest) -> Self {
        let state = match mr.state.as_str() {
            "opened" | "locked" => PullRequestState::Open,
            "merged" => PullRequestState::Merged,
            _ => PullRequestState::Closed,
        };
        let mergeable = match mr.merge_status.as_deref() {
            Some("can_be_merged") => Some(true),
            Some("cannot_be_merged") | Some("cannot_be_merged_recheck") => Some(false),
            _ => None,
        };
        ScmPullRequest {
            id: mr.iid.to_string(),
            state,
            url: mr.web_url,
            mergeable,
            created_at: mr.created_at,
            head_sha: mr.sha,
        }
    }
}

/// GitLab addresses projects by URL-encoded full path.
fn project_id(repo: &RepoRef) -> String {
    format!("{}/{}", repo.owner, repo.name).replace('/', "%2F")
}

impl GitLabClient {
    pub fn new(
        http: reqwest::Client,
        domain: &str,
        token: &str,
        git: Arc<dyn GitOperations>,
    ) -> Self {
        Self {
            http,
            api_base: format!("https://{domain}/api/v4"),
            token: token.to_string(),
            git,
        }
    }

    pub fn git(&self) -> Arc<dyn GitOperations> {
        Arc::clone(&self.git)
    }

    fn merge_requests_url(&self, repo: &RepoRef) -> String {
        format!(
            "{}/projects/{}/merge_requests",
            self.api_base,
            project_id(repo)
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ScmError> {
        let response = request
            .header("PRIVATE-TOKEN", &self.token)
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
            "source_branch": request.source_branch,
            "target_branch": request.target_branch,
            "title": request.title,
            "description": request.description,
        });
        let mr: MergeRequest = self
            .send(self.http.post(self.merge_requests_url(repo)).json(&body))
            .await?
            .json()
            .await?;
        Ok(mr.into())
    }

    pub async fn update_pull_request(
        &self,
        repo: &RepoRef,
        id: &str,
        request: &PullRequestRequest,
    ) -> Result<(), ScmError> {
        let body = json!({ "title": request.title, "description": request.description });
        self.send(
            self.http
                .put(format!("{}/{id}", self.merge_requests_url(repo)))
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
        self.send(
            self.http
                .put(format!("{}/{id}/merge", self.merge_requests_url(repo)))
                .json(&json!({ "sha": head_sha })),
        )
        .await?;
        Ok(())
    }

    pub async fn close_pull_request(&self, repo: &RepoRef, id: &str) -> Result<(), ScmError> {
        self.send(
            self.http
                .put(format!("{}/{id}", self.merge_requests_url(repo)))
                .json(&json!({ "state_event": "close" })),
        )
        .await?;
        Ok(())
    }

    pub async fn get_pull_request(
        &self,
        repo: &RepoRef,
        id: &str,
    ) -> Result<ScmPullRequest, ScmError> {
        let mr: MergeRequest = self
            .send(self.http.get(format!("{}/{id}", self.merge_requests_url(repo))))
            .await?
            .json()
            .await?;
        Ok(mr.into())
    }

    pub async fn find_open_pull_request(
        &self,
        repo: &RepoRef,
        source: &str,
        target: &str,
    ) -> Result<Option<ScmPullRequest>, ScmError> {
        let mrs: Vec<MergeRequest> = self
            .send(self.http.get(self.merge_requests_url(repo)).query(&[
                ("state", "opened"),
                ("source_branch", source),
                ("target_branch", target),
            ]))
            .await?
            .json()
            .await?;
        Ok(mrs.into_iter().next().map(Into::into))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_encodes_group_path() {
        assert_eq!(
            project_id(&RepoRef::new("platform/team", "deployments")),
            "platform%2Fteam%2Fdeployments"
        );
    }

    #[test]
    fn test_merge_request_mapping() {
        let mr: MergeRequest = serde_json::from_value(json!({
            "iid": 12,
            "state": "opened",
            "web_url": "https://gitlab.com/team/deploy/-/merge_requests/12",
            "merge_status": "cannot_be_merged",
            "sha": "abc123"
        }))
        .unwrap();
        let pr: ScmPullRequest = mr.into();
        assert_eq!(pr.id, "12");
        assert_eq!(pr.state, PullRequestState::Open);
        assert_eq!(pr.mergeable, Some(false));
    }
}
