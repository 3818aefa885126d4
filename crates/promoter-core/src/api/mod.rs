//! Resource API for the promoter.
//!
//! Canonical definitions for the objects reconciled or read by the
//! controllers:
//! - `PromotionStrategy`: an ordered chain of environments
//! - `ChangeTransferPolicy`: one environment's proposed -> active promotion
//! - `PullRequest`: local mirror of the SCM-hosted pull request
//! - `CommitStatus`: one externally reported check result for one SHA
//! - `ArgoCDCommitStatus` / `Application`: workload health bridge
//! - `GitRepository` / `ScmProvider` / `Secret`: repository and credentials

pub mod argocd;
pub mod change_transfer_policy;
pub mod commit_status;
pub mod condition;
pub mod git_repository;
pub mod promotion_strategy;
pub mod pull_request;

use serde::{Deserialize, Serialize};

pub use argocd::{
    Application, ApplicationHealth, ApplicationSpec, ApplicationStatus, ApplicationSync,
    ApplicationsSelected, ArgoCDCommitStatus, ArgoCDCommitStatusSpec, ArgoCDCommitStatusStatus,
    DrySource, HealthStatusCode, SourceHydrator, SyncSource, SyncStatusCode,
};
pub use change_transfer_policy::{
    ChangeTransferPolicy, ChangeTransferPolicySpec, ChangeTransferPolicyStatus,
    CommitBranchState, CommitShaState, CommitStatusPhase, PromotionCeiling, ProposalPhase,
    PullRequestSummary,
};
pub use commit_status::{CommitPhase, CommitStatus, CommitStatusSpec};
pub use condition::{
    reasons, ready_condition, set_condition, Condition, ConditionStatus, HasConditions, READY,
};
pub use git_repository::{
    FakeProviderSpec, ForgejoProviderSpec, GitHubProviderSpec, GitLabProviderSpec, GitRepository,
    GitRepositorySpec, ScmProvider, ScmProviderSpec, Secret,
};
pub use promotion_strategy::{
    Environment, EnvironmentStatus, HealthyDrySha, PromotionStrategy, PromotionStrategySpec,
    PromotionStrategyStatus,
};
pub use pull_request::{PullRequest, PullRequestSpec, PullRequestState, PullRequestStatus};

/// API group used for labels.
pub const GROUP: &str = "promoter.argoproj.io";

/// Label carrying a CommitStatus key.
pub const COMMIT_STATUS_LABEL: &str = "promoter.argoproj.io/commit-status";

/// Label linking a child object to the strategy that produced it.
pub const PROMOTION_STRATEGY_LABEL: &str = "promoter.argoproj.io/promotion-strategy";

/// Label linking a child object to its environment branch.
pub const ENVIRONMENT_LABEL: &str = "promoter.argoproj.io/environment";

/// Name of a sibling object in the same namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectReference {
    pub name: String,
}

impl ObjectReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Selects a required CommitStatus by key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitStatusSelector {
    pub key: String,
}

impl CommitStatusSelector {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Implement [`promoter_store::Resource`] for a struct with a `metadata` field.
macro_rules! impl_resource {
    ($ty:ty, $kind:literal) => {
        impl promoter_store::Resource for $ty {
            const KIND: &'static str = $kind;

            fn metadata(&self) -> &promoter_store::ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut promoter_store::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

pub(crate) use impl_resource;
