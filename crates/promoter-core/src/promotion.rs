//! PromotionStrategy reconciler.
//!
//! Fans a strategy out into one ChangeTransferPolicy per environment and
//! folds their reported state back into the strategy's status. Environment
//! `i + 1` gets a promotion ceiling built from environment `i`'s active
//! state, so nothing merges further down the chain than the previous
//! environment has already made active. Ceilings converge by iteration: each
//! policy status change re-triggers the strategy.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promoter_store::{typed, LabelSelector, ObjectKey, ObjectMeta, Resource};
use tracing::{info, Instrument};

use crate::api::{
    ready_condition, reasons, set_condition, ChangeTransferPolicy, ChangeTransferPolicySpec,
    ChangeTransferPolicyStatus, CommitPhase, Condition, ConditionStatus, Environment,
    EnvironmentStatus, GitRepository, HealthyDrySha, PromotionCeiling, PromotionStrategy,
    ENVIRONMENT_LABEL, PROMOTION_STRATEGY_LABEL,
};
use crate::context::ReconcileContext;
use crate::controller::{record_ready_failure, Action, Reconciler};
use crate::error::{PromoterError, Result};
use crate::naming;
use crate::obs;

/// Healthy dry SHAs remembered per environment.
pub const HEALTHY_HISTORY_LEN: usize = 10;

/// Check a strategy on its own and against the other strategies in its
/// namespace.
pub fn validate_strategy(strategy: &PromotionStrategy, others: &[PromotionStrategy]) -> Result<()> {
    let spec = &strategy.spec;
    let name = &strategy.metadata.name;
    if spec.repository_reference.name.is_empty() {
        return Err(PromoterError::Configuration(format!(
            "PromotionStrategy {name} has no repositoryReference"
        )));
    }
    if spec.environments.is_empty() {
        return Err(PromoterError::Configuration(format!(
            "PromotionStrategy {name} has no environments"
        )));
    }

    let mut branches = BTreeSet::new();
    for env in &spec.environments {
        if env.branch.is_empty() {
            return Err(PromoterError::Configuration(format!(
                "PromotionStrategy {name} has an environment without a branch"
            )));
        }
        if !branches.insert(env.branch.as_str()) {
            return Err(PromoterError::Configuration(format!(
                "branch {} appears more than once in PromotionStrategy {name}",
                env.branch
            )));
        }
    }
    // A branch that is another environment's proposed branch would feed the
    // chain back into itself.
    for env in &spec.environments {
        let proposed = env.proposed_branch();
        if branches.contains(proposed.as_str()) {
            return Err(PromoterError::Configuration(format!(
                "branch {proposed} is both an environment and the proposed branch of {} in PromotionStrategy {name}",
                env.branch
            )));
        }
    }

    for other in others {
        if other.metadata.name == *name
            || other.metadata.namespace != strategy.metadata.namespace
            || other.spec.repository_reference != spec.repository_reference
        {
            continue;
        }
        if let Some(shared) = other
            .spec
            .environments
            .iter()
            .find(|e| branches.contains(e.branch.as_str()))
        {
            return Err(PromoterError::Configuration(format!(
                "branch {} is used by both PromotionStrategy {name} and {}",
                shared.branch, other.metadata.name
            )));
        }
    }
    Ok(())
}

/// Name of the policy for `env`.
pub fn policy_name(strategy: &PromotionStrategy, env: &Environment) -> String {
    let name = &strategy.metadata.name;
    naming::child_name(&format!("{name}-{}", env.branch), name)
}

/// Ceiling for the environment after `previous`, from `previous`'s policy.
pub fn ceiling_from(
    previous: &Environment,
    status: Option<&ChangeTransferPolicyStatus>,
) -> PromotionCeiling {
    match status {
        Some(status) => PromotionCeiling {
            branch: previous.branch.clone(),
            dry_sha: status.active.dry.sha.clone(),
            phase: status.active.phase,
        },
        None => PromotionCeiling {
            branch: previous.branch.clone(),
            dry_sha: String::new(),
            phase: CommitPhase::Pending,
        },
    }
}

pub fn desired_policy(
    strategy: &PromotionStrategy,
    env: &Environment,
    ceiling: Option<PromotionCeiling>,
) -> ChangeTransferPolicy {
    let metadata = ObjectMeta::new(
        strategy.metadata.namespace.clone(),
        policy_name(strategy, env),
    )
    .with_label(PROMOTION_STRATEGY_LABEL, strategy.metadata.name.clone())
    .with_label(ENVIRONMENT_LABEL, naming::normalize(&env.branch))
    .with_owner(strategy.controller_reference());

    ChangeTransferPolicy {
        metadata,
        spec: ChangeTransferPolicySpec {
            repository_reference: strategy.spec.repository_reference.clone(),
            proposed_branch: env.proposed_branch(),
            active_branch: env.branch.clone(),
            auto_merge: env.auto_merge(),
            active_commit_statuses: strategy.spec.active_selectors(env),
            proposed_commit_statuses: strategy.spec.proposed_selectors(env),
            promotion_ceiling: ceiling,
        },
        status: ChangeTransferPolicyStatus::default(),
    }
}

/// Put `status.active.dry` at the front of `history` when the active checks
/// pass.
pub fn record_healthy(
    mut history: Vec<HealthyDrySha>,
    status: &ChangeTransferPolicyStatus,
    now: DateTime<Utc>,
) -> Vec<HealthyDrySha> {
    let sha = &status.active.dry.sha;
    if sha.is_empty() || status.active.phase != CommitPhase::Success {
        return history;
    }
    if history.first().is_some_and(|h| h.sha == *sha) {
        return history;
    }
    history.retain(|h| h.sha != *sha);
    history.insert(
        0,
        HealthyDrySha {
            sha: sha.clone(),
            time: now,
        },
    );
    history.truncate(HEALTHY_HISTORY_LEN);
    history
}

pub struct PromotionStrategyReconciler {
    ctx: ReconcileContext,
}

impl PromotionStrategyReconciler {
    pub fn new(ctx: ReconcileContext) -> Self {
        Self { ctx }
    }

    async fn upsert(
        &self,
        existing: Option<&ChangeTransferPolicy>,
        desired: ChangeTransferPolicy,
    ) -> Result<ChangeTransferPolicy> {
        let store = self.ctx.store();
        match existing {
            None => {
                info!(policy = %desired.metadata.name, branch = %desired.spec.active_branch, "creating ChangeTransferPolicy");
                Ok(typed::create(store, &desired).await?)
            }
            Some(current)
                if current.spec == desired.spec
                    && current.metadata.labels == desired.metadata.labels
                    && current.metadata.owner_references == desired.metadata.owner_references =>
            {
                Ok(current.clone())
            }
            Some(current) => {
                let mut next = current.clone();
                next.metadata.labels = desired.metadata.labels;
                next.metadata.owner_references = desired.metadata.owner_references;
                next.spec = desired.spec;
                Ok(typed::update(store, &next).await?)
            }
        }
    }

    async fn reconcile_strategy(&self, key: &ObjectKey) -> Result<Action> {
        let store = self.ctx.store();
        let Some(mut strategy) = typed::get_opt::<PromotionStrategy>(store, key).await? else {
            return Ok(Action::Done);
        };

        let siblings: Vec<PromotionStrategy> =
            typed::list(store, Some(&key.namespace), None).await?;
        validate_strategy(&strategy, &siblings)?;

        let repo_key = ObjectKey::new(
            key.namespace.clone(),
            strategy.spec.repository_reference.name.clone(),
        );
        if typed::get_opt::<GitRepository>(store, &repo_key)
            .await?
            .is_none()
        {
            return Err(PromoterError::dependency("GitRepository", repo_key.name));
        }

        let selector =
            LabelSelector::default().with_label(PROMOTION_STRATEGY_LABEL, key.name.clone());
        let owned: Vec<ChangeTransferPolicy> =
            typed::list::<ChangeTransferPolicy>(store, Some(&key.namespace), Some(&selector))
                .await?
                .into_iter()
                .filter(|p| p.metadata.is_owned_by(&strategy.metadata.uid))
                .collect();

        let mut policies: Vec<ChangeTransferPolicy> =
            Vec::with_capacity(strategy.spec.environments.len());
        for (index, env) in strategy.spec.environments.iter().enumerate() {
            let ceiling = match index {
                0 => None,
                _ => {
                    let previous = &strategy.spec.environments[index - 1];
                    Some(ceiling_from(
                        previous,
                        policies.get(index - 1).map(|p| &p.status),
                    ))
                }
            };
            let desired = desired_policy(&strategy, env, ceiling);
            let existing = owned
                .iter()
                .find(|p| p.metadata.name == desired.metadata.name);
            policies.push(self.upsert(existing, desired).await?);
        }

        let wanted: BTreeSet<&str> = policies.iter().map(|p| p.metadata.name.as_str()).collect();
        for orphan in owned
            .iter()
            .filter(|p| !wanted.contains(p.metadata.name.as_str()))
        {
            info!(policy = %orphan.metadata.name, "deleting ChangeTransferPolicy for removed environment");
            match typed::delete::<ChangeTransferPolicy>(store, &orphan.key()).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }

        let now = self.ctx.clock.now();
        let environments: Vec<EnvironmentStatus> = strategy
            .spec
            .environments
            .iter()
            .zip(&policies)
            .map(|(env, policy)| {
                let history = strategy
                    .status
                    .environment(&env.branch)
                    .map(|e| e.last_healthy_dry_shas.clone())
                    .unwrap_or_default();
                EnvironmentStatus {
                    branch: env.branch.clone(),
                    active: policy.status.active.clone(),
                    proposed: policy.status.proposed.clone(),
                    phase: policy.status.phase,
                    ready: ready_condition(&policy.status.conditions)
                        .map(|c| c.status)
                        .unwrap_or(ConditionStatus::Unknown),
                    last_healthy_dry_shas: record_healthy(history, &policy.status, now),
                }
            })
            .collect();

        let ready = chain_ready(&environments, strategy.metadata.generation, now);
        strategy.status.environments = environments;
        set_condition(&mut strategy.status.conditions, ready);
        typed::update_status(store, &strategy).await?;

        Ok(Action::RequeueAfter(
            self.ctx.config.promotion_strategy_requeue(),
        ))
    }
}

/// `Ready` of the chain from the `Ready` of each environment's policy.
fn chain_ready(
    environments: &[EnvironmentStatus],
    generation: u64,
    now: DateTime<Utc>,
) -> Condition {
    if let Some(failed) = environments
        .iter()
        .find(|e| e.ready == ConditionStatus::False)
    {
        return Condition::ready(
            ConditionStatus::False,
            reasons::CHILD_NOT_READY,
            format!("ChangeTransferPolicy for {} is not ready", failed.branch),
            generation,
            now,
        );
    }
    let waiting: Vec<&str> = environments
        .iter()
        .filter(|e| e.ready == ConditionStatus::Unknown)
        .map(|e| e.branch.as_str())
        .collect();
    if !waiting.is_empty() {
        return Condition::ready(
            ConditionStatus::Unknown,
            reasons::WAITING_FOR_CHILDREN,
            format!("waiting for {}", waiting.join(", ")),
            generation,
            now,
        );
    }
    Condition::ready(
        ConditionStatus::True,
        reasons::RECONCILIATION_SUCCESS,
        format!("{} environments ready", environments.len()),
        generation,
        now,
    )
}

#[async_trait]
impl Reconciler for PromotionStrategyReconciler {
    fn kind(&self) -> &'static str {
        PromotionStrategy::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let span = obs::reconcile_span(self.kind(), key);
        self.reconcile_strategy(key).instrument(span).await
    }

    async fn record_failure(&self, key: &ObjectKey, error: &PromoterError) -> Result<()> {
        record_ready_failure::<PromotionStrategy>(
            self.ctx.store(),
            self.ctx.clock.as_ref(),
            key,
            error,
        )
        .await
    }
}
