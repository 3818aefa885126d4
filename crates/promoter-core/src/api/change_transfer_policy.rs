//! ChangeTransferPolicy: promotion of one environment from its proposed
//! branch into its active branch.

use chrono::{DateTime, Utc};
use promoter_store::ObjectMeta;
use serde::{Deserialize, Serialize};

use super::{
    impl_resource, CommitPhase, CommitStatusSelector, Condition, HasConditions, ObjectReference,
    PullRequestState,
};
use crate::error::{PromoterError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeTransferPolicy {
    pub metadata: ObjectMeta,
    pub spec: ChangeTransferPolicySpec,
    #[serde(default)]
    pub status: ChangeTransferPolicyStatus,
}

fn default_auto_merge() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeTransferPolicySpec {
    pub repository_reference: ObjectReference,
    pub proposed_branch: String,
    pub active_branch: String,
    #[serde(default = "default_auto_merge")]
    pub auto_merge: bool,
    /// Keys that must pass on the active hydrated commit.
    #[serde(default)]
    pub active_commit_statuses: Vec<CommitStatusSelector>,
    /// Keys that must pass on the proposed hydrated commit before merging.
    #[serde(default)]
    pub proposed_commit_statuses: Vec<CommitStatusSelector>,
    /// Set by the owning strategy for every environment after the first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion_ceiling: Option<PromotionCeiling>,
}

impl ChangeTransferPolicySpec {
    pub fn validate(&self) -> Result<()> {
        if self.proposed_branch.is_empty() || self.active_branch.is_empty() {
            return Err(PromoterError::Configuration(
                "proposedBranch and activeBranch must both be set".to_string(),
            ));
        }
        if self.proposed_branch == self.active_branch {
            return Err(PromoterError::Configuration(format!(
                "proposedBranch and activeBranch are both '{}'",
                self.active_branch
            )));
        }
        Ok(())
    }

    pub fn proposed_keys(&self) -> Vec<String> {
        self.proposed_commit_statuses
            .iter()
            .map(|s| s.key.clone())
            .collect()
    }

    pub fn active_keys(&self) -> Vec<String> {
        self.active_commit_statuses
            .iter()
            .map(|s| s.key.clone())
            .collect()
    }
}

/// The previous environment's active state, which bounds what this
/// environment may merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionCeiling {
    /// Branch of the previous environment.
    pub branch: String,
    /// Dry SHA currently active in the previous environment.
    pub dry_sha: String,
    /// Aggregate of the previous environment's active checks.
    pub phase: CommitPhase,
}

impl PromotionCeiling {
    /// A proposal for `dry_sha` may merge only once the previous environment
    /// runs the same dry SHA and its active checks pass.
    pub fn permits(&self, dry_sha: &str) -> bool {
        !self.dry_sha.is_empty() && self.dry_sha == dry_sha && self.phase == CommitPhase::Success
    }

    pub fn blocked_reason(&self, dry_sha: &str) -> String {
        if self.dry_sha != dry_sha {
            format!(
                "waiting for {} to run dry commit {} (currently {})",
                self.branch,
                short_sha(dry_sha),
                if self.dry_sha.is_empty() {
                    "unknown".to_string()
                } else {
                    short_sha(&self.dry_sha).to_string()
                }
            )
        } else {
            format!(
                "waiting for active checks on {} to pass (currently {})",
                self.branch, self.phase
            )
        }
    }
}

pub(crate) fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalPhase {
    #[default]
    NoProposal,
    ProposalOpen,
    ProposalPassing,
    Merged,
    Closed,
}

/// One commit as the promoter understands it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitShaState {
    #[serde(default)]
    pub sha: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitStatusPhase {
    pub key: String,
    pub phase: CommitPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

/// Dry and hydrated commit of a branch plus the checks evaluated on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitBranchState {
    #[serde(default)]
    pub dry: CommitShaState,
    #[serde(default)]
    pub hydrated: CommitShaState,
    #[serde(default)]
    pub commit_statuses: Vec<CommitStatusPhase>,
    #[serde(default)]
    pub phase: CommitPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestSummary {
    pub id: String,
    pub state: PullRequestState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeTransferPolicyStatus {
    #[serde(default)]
    pub proposed: CommitBranchState,
    #[serde(default)]
    pub active: CommitBranchState,
    #[serde(default)]
    pub phase: ProposalPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestSummary>,
    /// Why an otherwise mergeable proposal is being held back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl_resource!(ChangeTransferPolicy, "ChangeTransferPolicy");

impl HasConditions for ChangeTransferPolicy {
    fn conditions(&self) -> &[Condition] {
        &self.status.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.conditions
    }
}
