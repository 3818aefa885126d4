use chrono::{DateTime, Utc};
use promoter_store::ObjectMeta;
use serde::{Deserialize, Serialize};

use super::{impl_resource, ObjectReference};

/// Local mirror of the pull request a ChangeTransferPolicy owns.
///
/// `spec` holds the last values successfully applied to the SCM, so comparing
/// it with the desired request tells whether an SCM call is needed at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub metadata: ObjectMeta,
    pub spec: PullRequestSpec,
    #[serde(default)]
    pub status: PullRequestStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestSpec {
    pub repository_reference: ObjectReference,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub source_branch: String,
    pub target_branch: String,
    /// Head of the source branch when the request was last applied.
    #[serde(default)]
    pub source_sha: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestState {
    #[default]
    Open,
    Merged,
    Closed,
}

impl PullRequestState {
    pub fn is_open(self) -> bool {
        self == PullRequestState::Open
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestStatus {
    /// Provider-assigned id (number / iid / index). Empty until created.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub state: PullRequestState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// When `state` was last confirmed against the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<DateTime<Utc>>,
}

impl_resource!(PullRequest, "PullRequest");

impl PullRequest {
    /// Open on the SCM as far as the mirror knows.
    pub fn is_open(&self) -> bool {
        !self.status.id.is_empty() && self.status.state.is_open()
    }
}
