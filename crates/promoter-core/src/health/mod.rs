//! Health bridge: publishes the health of deployed Applications as
//! CommitStatus objects.
//!
//! An ArgoCDCommitStatus selects Applications by label. They are grouped by
//! the environment branch they deploy from, each group is reduced to one
//! phase for the branch head, and the result is written as a CommitStatus
//! keyed `argocd-health` that ChangeTransferPolicies can require like any
//! other check.

pub mod revision_cache;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promoter_store::{
    typed, LabelSelector, ObjectKey, ObjectMeta, Resource, WatchEvent, WatchEventType,
};
use tracing::{debug, info, warn, Instrument};

use crate::aggregate::{apply_settling_window, PhaseCounts, SETTLING_WINDOW};
use crate::api::{
    reasons, set_condition, Application, ApplicationsSelected, ArgoCDCommitStatus, CommitPhase,
    CommitStatus, CommitStatusSpec, Condition, ConditionStatus, HealthStatusCode,
    PromotionStrategy, SyncStatusCode, COMMIT_STATUS_LABEL,
};
use crate::clock::Clock;
use crate::context::ReconcileContext;
use crate::controller::{record_ready_failure, Action, EventMapper, Reconciler};
use crate::error::{PromoterError, Result};
use crate::naming;
use crate::obs;

pub use revision_cache::{RevisionCache, SUPPRESSION_WINDOW};

/// Commit status key of the published health checks.
pub const HEALTH_STATUS_KEY: &str = "argocd-health";

/// Phase of one Application measured against the branch head it should run.
///
/// An Application still on an older revision is pending whatever its health
/// says, since that health describes a different commit.
pub fn application_phase(app: &Application, head: &str) -> CommitPhase {
    let status = &app.status;
    if status.sync.revision != head {
        return CommitPhase::Pending;
    }
    match (status.health.status, status.sync.status) {
        (HealthStatusCode::Healthy, SyncStatusCode::Synced) => CommitPhase::Success,
        (HealthStatusCode::Degraded, _) => CommitPhase::Failure,
        _ => CommitPhase::Pending,
    }
}

/// Group `apps` by target branch. Every Application must use the hydrator
/// and all of them must render from the same dry repository.
pub fn group_by_branch(apps: &[Application]) -> Result<BTreeMap<String, Vec<&Application>>> {
    let mut repo: Option<&str> = None;
    let mut groups: BTreeMap<String, Vec<&Application>> = BTreeMap::new();
    for app in apps {
        let (Some(branch), Some(url)) = (app.target_branch(), app.dry_repo_url()) else {
            return Err(PromoterError::Configuration(format!(
                "Application {} has no sourceHydrator configured",
                app.key()
            )));
        };
        match repo {
            None => repo = Some(url),
            Some(seen) if seen != url => {
                return Err(PromoterError::Configuration(format!(
                    "selected Applications use different repositories ({seen} and {url})"
                )))
            }
            Some(_) => {}
        }
        groups.entry(branch.to_string()).or_default().push(app);
    }
    Ok(groups)
}

/// Health of one environment branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchHealth {
    pub phase: CommitPhase,
    pub description: String,
    /// The settling window is holding an otherwise final phase at pending.
    pub settling: bool,
}

pub fn evaluate_branch(apps: &[&Application], head: &str, now: DateTime<Utc>) -> BranchHealth {
    let counts = PhaseCounts::from_phases(apps.iter().map(|app| application_phase(app, head)));
    let instant = counts.phase();
    let last_transition = apps
        .iter()
        .filter_map(|app| app.status.health.last_transition_time)
        .max();
    let phase = apply_settling_window(instant, last_transition, now);
    BranchHealth {
        phase,
        description: counts.describe("apps", "healthy", "degraded"),
        settling: phase != instant,
    }
}

/// Object name of the health CommitStatus for `branch`.
pub fn health_status_name(branch: &str, owner: &str) -> String {
    naming::child_name(&format!("{branch}/health"), owner)
}

pub struct HealthBridgeReconciler {
    ctx: ReconcileContext,
}

impl HealthBridgeReconciler {
    pub fn new(ctx: ReconcileContext) -> Self {
        Self { ctx }
    }

    async fn publish_commit_status(
        &self,
        owner: &ArgoCDCommitStatus,
        desired: CommitStatus,
    ) -> Result<()> {
        let store = self.ctx.store();
        match typed::get_opt::<CommitStatus>(store, &desired.key()).await? {
            Some(current) if current.spec == desired.spec => {
                debug!(commit_status = %desired.metadata.name, "health status already current");
            }
            Some(mut current) => {
                current.spec = desired.spec;
                current.metadata.labels = desired.metadata.labels;
                typed::update(store, &current).await?;
                obs::emit_commit_status_published(
                    &current.spec.name,
                    &current.spec.sha,
                    current.spec.phase,
                );
            }
            None => {
                typed::create(store, &desired).await?;
                info!(commit_status = %desired.metadata.name, owner = %owner.metadata.name, "created health commit status");
                obs::emit_commit_status_published(
                    &desired.spec.name,
                    &desired.spec.sha,
                    desired.spec.phase,
                );
            }
        }
        Ok(())
    }

    /// Delete health statuses this bridge published for branches it no
    /// longer selects.
    async fn prune(&self, owner: &ArgoCDCommitStatus, keep: &[String]) -> Result<()> {
        let store = self.ctx.store();
        let selector = LabelSelector::default().with_label(COMMIT_STATUS_LABEL, HEALTH_STATUS_KEY);
        let published: Vec<CommitStatus> =
            typed::list(store, Some(&owner.metadata.namespace), Some(&selector)).await?;
        for stale in published.iter().filter(|cs| {
            cs.metadata.is_owned_by(&owner.metadata.uid) && !keep.contains(&cs.metadata.name)
        }) {
            info!(commit_status = %stale.metadata.name, "deleting health status for unselected branch");
            match typed::delete::<CommitStatus>(store, &stale.key()).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn reconcile_bridge(&self, key: &ObjectKey) -> Result<Action> {
        let store = self.ctx.store();
        let Some(mut bridge) = typed::get_opt::<ArgoCDCommitStatus>(store, key).await? else {
            return Ok(Action::Done);
        };
        bridge.spec.application_selector.validate()?;

        let strategy_name = &bridge.spec.promotion_strategy_ref.name;
        let strategy: PromotionStrategy = typed::get_opt(
            store,
            &ObjectKey::new(key.namespace.clone(), strategy_name.clone()),
        )
        .await?
        .ok_or_else(|| PromoterError::dependency("PromotionStrategy", strategy_name))?;

        // Applications may live in any namespace.
        let apps: Vec<Application> =
            typed::list(store, None, Some(&bridge.spec.application_selector)).await?;
        let groups = group_by_branch(&apps)?;
        debug!(applications = apps.len(), branches = groups.len(), "selected applications");

        let heads = if groups.is_empty() {
            Default::default()
        } else {
            let (repository, scm) = self
                .ctx
                .resolve_repository(&key.namespace, &strategy.spec.repository_reference)
                .await?;
            let branches: Vec<String> = groups.keys().cloned().collect();
            scm.git()
                .ls_remote(&repository.repo_ref(), &branches)
                .await?
        };

        let now = self.ctx.clock.now();
        let mut selected = Vec::with_capacity(apps.len());
        let mut published = Vec::with_capacity(groups.len());
        let mut settling = false;
        for (branch, members) in &groups {
            let head = heads
                .get(branch)
                .ok_or_else(|| PromoterError::dependency("branch", branch))?;
            let health = evaluate_branch(members, head, now);
            settling |= health.settling;

            let name = health_status_name(branch, &bridge.metadata.name);
            let desired = CommitStatus {
                metadata: ObjectMeta::new(key.namespace.clone(), name.clone())
                    .with_label(COMMIT_STATUS_LABEL, HEALTH_STATUS_KEY)
                    .with_owner(bridge.controller_reference()),
                spec: CommitStatusSpec {
                    repository_reference: strategy.spec.repository_reference.clone(),
                    sha: head.clone(),
                    name: format!("{branch}/health"),
                    description: health.description,
                    phase: health.phase,
                    url: String::new(),
                },
            };
            self.publish_commit_status(&bridge, desired).await?;
            published.push(name);

            for app in members {
                selected.push(ApplicationsSelected {
                    namespace: app.metadata.namespace.clone(),
                    name: app.metadata.name.clone(),
                    environment: branch.clone(),
                    phase: application_phase(app, head),
                    sha: app.status.sync.revision.clone(),
                    last_transition_time: app.status.health.last_transition_time,
                });
            }
        }
        self.prune(&bridge, &published).await?;

        selected.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        bridge.status.applications_selected = selected;
        let generation = bridge.metadata.generation;
        set_condition(
            &mut bridge.status.conditions,
            Condition::ready(
                ConditionStatus::True,
                reasons::RECONCILIATION_SUCCESS,
                format!(
                    "{} applications across {} branches",
                    apps.len(),
                    groups.len()
                ),
                generation,
                now,
            ),
        );
        typed::update_status(store, &bridge).await?;

        let requeue = self.ctx.config.argocd_commit_status_requeue();
        Ok(Action::RequeueAfter(if settling {
            requeue.min(SETTLING_WINDOW)
        } else {
            requeue
        }))
    }
}

#[async_trait]
impl Reconciler for HealthBridgeReconciler {
    fn kind(&self) -> &'static str {
        ArgoCDCommitStatus::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let span = obs::reconcile_span(self.kind(), key);
        self.reconcile_bridge(key).instrument(span).await
    }

    async fn record_failure(&self, key: &ObjectKey, error: &PromoterError) -> Result<()> {
        record_ready_failure::<ArgoCDCommitStatus>(
            self.ctx.store(),
            self.ctx.clock.as_ref(),
            key,
            error,
        )
        .await
    }
}

/// Maps Application changes onto the ArgoCDCommitStatus objects selecting
/// them, dropping churn the [`RevisionCache`] deems uninteresting.
pub struct ApplicationMapper {
    ctx: ReconcileContext,
    cache: Arc<RevisionCache>,
}

impl ApplicationMapper {
    pub fn new(ctx: ReconcileContext, cache: Arc<RevisionCache>) -> Self {
        Self { ctx, cache }
    }

    pub fn cache(&self) -> &RevisionCache {
        &self.cache
    }

    fn clock(&self) -> &dyn Clock {
        self.ctx.clock.as_ref()
    }
}

#[async_trait]
impl EventMapper for ApplicationMapper {
    fn source_kind(&self) -> &'static str {
        Application::KIND
    }

    async fn map(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        if event.event_type == WatchEventType::Deleted {
            return Vec::new();
        }
        let store = self.ctx.store();
        let key = event.metadata.key();
        let app: Application = match typed::get_opt(store, &key).await {
            Ok(Some(app)) => app,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(application = %key, error = %err, "failed to read Application");
                return Vec::new();
            }
        };
        if !self.cache.should_enqueue(
            &key,
            &app.status.sync.revision,
            app.status.health.last_transition_time,
            self.clock().now(),
        ) {
            return Vec::new();
        }

        let bridges: Vec<ArgoCDCommitStatus> = match typed::list(store, None, None).await {
            Ok(bridges) => bridges,
            Err(err) => {
                warn!(error = %err, "failed to list ArgoCDCommitStatus objects");
                return Vec::new();
            }
        };
        bridges
            .iter()
            .filter(|b| {
                b.spec.application_selector.validate().is_ok()
                    && b.spec.application_selector.matches(&app.metadata.labels)
            })
            .map(|b| {
                debug!(application = %key, bridge = %b.key(), "application change triggers health bridge");
                b.key()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        ApplicationHealth, ApplicationSpec, ApplicationStatus, ApplicationSync, DrySource,
        SourceHydrator, SyncSource,
    };
    use chrono::Duration;

    fn app(
        name: &str,
        branch: &str,
        repo: &str,
        health: HealthStatusCode,
        revision: &str,
    ) -> Application {
        Application {
            metadata: ObjectMeta::new("argocd", name),
            spec: ApplicationSpec {
                source_hydrator: Some(SourceHydrator {
                    dry_source: DrySource {
                        repo_url: repo.to_string(),
                        target_revision: "main".to_string(),
                    },
                    sync_source: SyncSource {
                        target_branch: branch.to_string(),
                        path: name.to_string(),
                    },
                }),
            },
            status: ApplicationStatus {
                health: ApplicationHealth {
                    status: health,
                    last_transition_time: None,
                },
                sync: ApplicationSync {
                    status: SyncStatusCode::Synced,
                    revision: revision.to_string(),
                },
            },
        }
    }

    const REPO: &str = "https://example.com/org/deploy.git";

    #[test]
    fn test_application_phase() {
        let healthy = app("a", "environment/dev", REPO, HealthStatusCode::Healthy, "h1");
        assert_eq!(application_phase(&healthy, "h1"), CommitPhase::Success);
        assert_eq!(application_phase(&healthy, "h2"), CommitPhase::Pending);

        let degraded = app("a", "environment/dev", REPO, HealthStatusCode::Degraded, "h1");
        assert_eq!(application_phase(&degraded, "h1"), CommitPhase::Failure);
        assert_eq!(application_phase(&degraded, "h2"), CommitPhase::Pending);

        let mut out_of_sync = healthy.clone();
        out_of_sync.status.sync.status = SyncStatusCode::OutOfSync;
        assert_eq!(application_phase(&out_of_sync, "h1"), CommitPhase::Pending);

        let progressing = app("a", "environment/dev", REPO, HealthStatusCode::Progressing, "h1");
        assert_eq!(application_phase(&progressing, "h1"), CommitPhase::Pending);
    }

    #[test]
    fn test_group_by_branch() {
        let apps = vec![
            app("a", "environment/dev", REPO, HealthStatusCode::Healthy, "h1"),
            app("b", "environment/prod", REPO, HealthStatusCode::Healthy, "h2"),
            app("c", "environment/dev", REPO, HealthStatusCode::Healthy, "h1"),
        ];
        let groups = group_by_branch(&apps).unwrap();
        assert_eq!(groups["environment/dev"].len(), 2);
        assert_eq!(groups["environment/prod"].len(), 1);
    }

    #[test]
    fn test_group_rejects_mixed_repositories() {
        let apps = vec![
            app("a", "environment/dev", REPO, HealthStatusCode::Healthy, "h1"),
            app("b", "environment/dev", "https://example.com/other.git", HealthStatusCode::Healthy, "h1"),
        ];
        assert!(matches!(
            group_by_branch(&apps),
            Err(PromoterError::Configuration(_))
        ));
    }

    #[test]
    fn test_group_rejects_application_without_hydrator() {
        let mut plain = app("a", "environment/dev", REPO, HealthStatusCode::Healthy, "h1");
        plain.spec.source_hydrator = None;
        assert!(group_by_branch(&[plain]).is_err());
    }

    #[test]
    fn test_evaluate_branch_settles() {
        let t = Utc::now();
        let mut a = app("a", "environment/dev", REPO, HealthStatusCode::Healthy, "h1");
        a.status.health.last_transition_time = Some(t);
        let b = app("b", "environment/dev", REPO, HealthStatusCode::Healthy, "h1");

        let early = evaluate_branch(&[&a, &b], "h1", t + Duration::seconds(4));
        assert_eq!(early.phase, CommitPhase::Pending);
        assert!(early.settling);
        assert_eq!(early.description, "2/2 apps healthy");

        let late = evaluate_branch(&[&a, &b], "h1", t + Duration::seconds(6));
        assert_eq!(late.phase, CommitPhase::Success);
        assert!(!late.settling);
    }

    #[test]
    fn test_evaluate_branch_pending_beats_failure() {
        let a = app("a", "environment/dev", REPO, HealthStatusCode::Degraded, "h1");
        let b = app("b", "environment/dev", REPO, HealthStatusCode::Healthy, "h0");
        let health = evaluate_branch(&[&a, &b], "h1", Utc::now());
        assert_eq!(health.phase, CommitPhase::Pending);
        assert_eq!(health.description, "0/2 apps healthy, 1 pending, 1 degraded");
    }
}
