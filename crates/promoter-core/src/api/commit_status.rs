use promoter_store::ObjectMeta;
use serde::{Deserialize, Serialize};

use super::{impl_resource, ObjectReference};

/// Outcome of a single check, or of an aggregate of checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitPhase {
    #[default]
    Pending,
    Success,
    Failure,
}

impl CommitPhase {
    /// Ordering used when two reports for the same key and SHA disagree.
    pub(crate) fn severity(self) -> u8 {
        match self {
            CommitPhase::Success => 0,
            CommitPhase::Pending => 1,
            CommitPhase::Failure => 2,
        }
    }
}

impl std::fmt::Display for CommitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommitPhase::Pending => "pending",
            CommitPhase::Success => "success",
            CommitPhase::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// An externally reported check result bound to exactly one commit.
///
/// A record only counts for the SHA in `spec.sha`; once a branch moves the
/// record is stale for that branch until it is rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub metadata: ObjectMeta,
    pub spec: CommitStatusSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitStatusSpec {
    pub repository_reference: ObjectReference,
    pub sha: String,
    /// Display name; doubles as the key when no commit-status label is set.
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub phase: CommitPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

impl_resource!(CommitStatus, "CommitStatus");

impl CommitStatus {
    /// The key policies select on: the commit-status label when present,
    /// otherwise `spec.name`.
    pub fn status_key(&self) -> &str {
        self.metadata
            .labels
            .get(super::COMMIT_STATUS_LABEL)
            .map(String::as_str)
            .unwrap_or(&self.spec.name)
    }
}
