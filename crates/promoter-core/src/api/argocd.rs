//! Workload health bridge resources.
//!
//! `Application` is read-only input written by the deployment tool;
//! `ArgoCDCommitStatus` selects applications and publishes their combined
//! health as CommitStatus objects.

use chrono::{DateTime, Utc};
use promoter_store::{LabelSelector, ObjectMeta};
use serde::{Deserialize, Serialize};

use super::{impl_resource, Condition, HasConditions, ObjectReference};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgoCDCommitStatus {
    pub metadata: ObjectMeta,
    pub spec: ArgoCDCommitStatusSpec,
    #[serde(default)]
    pub status: ArgoCDCommitStatusStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgoCDCommitStatusSpec {
    pub promotion_strategy_ref: ObjectReference,
    pub application_selector: LabelSelector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationsSelected {
    pub namespace: String,
    pub name: String,
    pub environment: String,
    pub phase: super::CommitPhase,
    #[serde(default)]
    pub sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgoCDCommitStatusStatus {
    #[serde(default)]
    pub applications_selected: Vec<ApplicationsSelected>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl_resource!(ArgoCDCommitStatus, "ArgoCDCommitStatus");

impl HasConditions for ArgoCDCommitStatus {
    fn conditions(&self) -> &[Condition] {
        &self.status.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.conditions
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ApplicationSpec,
    #[serde(default)]
    pub status: ApplicationStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_hydrator: Option<SourceHydrator>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceHydrator {
    pub dry_source: DrySource,
    pub sync_source: SyncSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrySource {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default)]
    pub target_revision: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSource {
    /// Environment branch the application deploys from.
    pub target_branch: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatusCode {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
    Missing,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatusCode {
    Synced,
    OutOfSync,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationHealth {
    #[serde(default)]
    pub status: HealthStatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSync {
    #[serde(default)]
    pub status: SyncStatusCode,
    /// Hydrated SHA the application last synced to.
    #[serde(default)]
    pub revision: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    #[serde(default)]
    pub health: ApplicationHealth,
    #[serde(default)]
    pub sync: ApplicationSync,
}

impl_resource!(Application, "Application");

impl Application {
    pub fn target_branch(&self) -> Option<&str> {
        self.spec
            .source_hydrator
            .as_ref()
            .map(|h| h.sync_source.target_branch.as_str())
    }

    pub fn dry_repo_url(&self) -> Option<&str> {
        self.spec
            .source_hydrator
            .as_ref()
            .map(|h| h.dry_source.repo_url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_parses_deployment_tool_shape() {
        let app: Application = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "web-dev", "namespace": "argocd" },
            "spec": {
                "sourceHydrator": {
                    "drySource": { "repoURL": "https://github.com/argoproj/deployments", "targetRevision": "main" },
                    "syncSource": { "targetBranch": "environment/dev", "path": "web" }
                }
            },
            "status": {
                "health": { "status": "Healthy", "lastTransitionTime": "2024-05-01T10:00:00Z" },
                "sync": { "status": "Synced", "revision": "abc123" }
            }
        }))
        .unwrap();

        assert_eq!(app.target_branch(), Some("environment/dev"));
        assert_eq!(
            app.dry_repo_url(),
            Some("https://github.com/argoproj/deployments")
        );
        assert_eq!(app.status.health.status, HealthStatusCode::Healthy);
        assert_eq!(app.status.sync.status, SyncStatusCode::Synced);
    }

    #[test]
    fn test_application_without_hydrator_has_no_branch() {
        let app: Application = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "legacy", "namespace": "argocd" }
        }))
        .unwrap();
        assert!(app.target_branch().is_none());
        assert_eq!(app.status.health.status, HealthStatusCode::Unknown);
    }
}
