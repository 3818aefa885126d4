//! PromotionStrategy: an ordered chain of environments in one repository.

use chrono::{DateTime, Utc};
use promoter_store::ObjectMeta;
use serde::{Deserialize, Serialize};

use super::{
    impl_resource, CommitBranchState, CommitStatusSelector, Condition, ConditionStatus,
    HasConditions, ObjectReference, ProposalPhase,
};

/// Suffix of the branch a hydrator writes proposals for an environment to.
pub const PROPOSED_BRANCH_SUFFIX: &str = "-next";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionStrategy {
    pub metadata: ObjectMeta,
    pub spec: PromotionStrategySpec,
    #[serde(default)]
    pub status: PromotionStrategyStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionStrategySpec {
    pub repository_reference: ObjectReference,
    /// Active checks required in every environment.
    #[serde(default)]
    pub active_commit_statuses: Vec<CommitStatusSelector>,
    /// Proposed checks required in every environment.
    #[serde(default)]
    pub proposed_commit_statuses: Vec<CommitStatusSelector>,
    /// Promotion order, first to last.
    pub environments: Vec<Environment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_merge: Option<bool>,
    #[serde(default)]
    pub active_commit_statuses: Vec<CommitStatusSelector>,
    #[serde(default)]
    pub proposed_commit_statuses: Vec<CommitStatusSelector>,
}

impl Environment {
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            auto_merge: None,
            active_commit_statuses: Vec::new(),
            proposed_commit_statuses: Vec::new(),
        }
    }

    pub fn proposed_branch(&self) -> String {
        format!("{}{}", self.branch, PROPOSED_BRANCH_SUFFIX)
    }

    pub fn auto_merge(&self) -> bool {
        self.auto_merge.unwrap_or(true)
    }
}

impl PromotionStrategySpec {
    /// Strategy-wide keys followed by the environment's own, without repeats.
    pub fn active_selectors(&self, env: &Environment) -> Vec<CommitStatusSelector> {
        merge_selectors(&self.active_commit_statuses, &env.active_commit_statuses)
    }

    pub fn proposed_selectors(&self, env: &Environment) -> Vec<CommitStatusSelector> {
        merge_selectors(&self.proposed_commit_statuses, &env.proposed_commit_statuses)
    }
}

fn merge_selectors(
    global: &[CommitStatusSelector],
    local: &[CommitStatusSelector],
) -> Vec<CommitStatusSelector> {
    let mut merged: Vec<CommitStatusSelector> = Vec::with_capacity(global.len() + local.len());
    for selector in global.iter().chain(local) {
        if !merged.contains(selector) {
            merged.push(selector.clone());
        }
    }
    merged
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthyDrySha {
    pub sha: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStatus {
    pub branch: String,
    #[serde(default)]
    pub active: CommitBranchState,
    #[serde(default)]
    pub proposed: CommitBranchState,
    #[serde(default)]
    pub phase: ProposalPhase,
    pub ready: ConditionStatus,
    /// Most recent first.
    #[serde(default)]
    pub last_healthy_dry_shas: Vec<HealthyDrySha>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionStrategyStatus {
    #[serde(default)]
    pub environments: Vec<EnvironmentStatus>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl PromotionStrategyStatus {
    pub fn environment(&self, branch: &str) -> Option<&EnvironmentStatus> {
        self.environments.iter().find(|e| e.branch == branch)
    }
}

impl_resource!(PromotionStrategy, "PromotionStrategy");

impl HasConditions for PromotionStrategy {
    fn conditions(&self) -> &[Condition] {
        &self.status.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.conditions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selectors_merge_without_repeats() {
        let spec = PromotionStrategySpec {
            repository_reference: ObjectReference::new("repo"),
            active_commit_statuses: vec![CommitStatusSelector::new("argocd-health")],
            proposed_commit_statuses: vec![],
            environments: vec![],
        };
        let mut env = Environment::new("environment/prod");
        env.active_commit_statuses = vec![
            CommitStatusSelector::new("argocd-health"),
            CommitStatusSelector::new("smoke"),
        ];
        let keys: Vec<String> = spec
            .active_selectors(&env)
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(keys, vec!["argocd-health", "smoke"]);
    }

    #[test]
    fn test_environment_defaults() {
        let env = Environment::new("environment/dev");
        assert_eq!(env.proposed_branch(), "environment/dev-next");
        assert!(env.auto_merge());
    }
}
