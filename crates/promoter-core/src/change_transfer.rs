//! ChangeTransferPolicy reconciler.
//!
//! One pass:
//! 1. resolve the heads of the proposed and active branches
//! 2. describe both commits (hydrated commit plus the dry commit it renders)
//! 3. aggregate the required commit statuses for each
//! 4. plan and execute the pull request actions
//! 5. republish both branch states and the `Ready` condition

use async_trait::async_trait;
use promoter_store::{typed, ObjectKey, Resource, WatchEvent};
use tracing::{debug, warn, Instrument};

use crate::aggregate::aggregate_commit_statuses;
use crate::api::{
    reasons, set_condition, ChangeTransferPolicy, CommitBranchState, CommitStatus, Condition,
    ConditionStatus, ProposalPhase, PullRequest, PullRequestSummary,
};
use crate::context::ReconcileContext;
use crate::controller::{record_ready_failure, Action, EventMapper, Reconciler};
use crate::error::{PromoterError, Result};
use crate::git::{describe_commit, GitOperations};
use crate::obs;
use crate::pull_request::{plan_proposal, ProposalInput, PullRequestMirror};
use crate::scm::RepoRef;

pub struct ChangeTransferPolicyReconciler {
    ctx: ReconcileContext,
}

impl ChangeTransferPolicyReconciler {
    pub fn new(ctx: ReconcileContext) -> Self {
        Self { ctx }
    }

    async fn branch_state(
        &self,
        git: &dyn GitOperations,
        repo: &RepoRef,
        branch: &str,
        head: &str,
        required: &[String],
        records: &[CommitStatus],
    ) -> Result<CommitBranchState> {
        let (hydrated, dry) = describe_commit(git, repo, branch, head).await?;
        let aggregate = aggregate_commit_statuses(required, head, records);
        Ok(CommitBranchState {
            dry,
            hydrated,
            commit_statuses: aggregate.statuses,
            phase: aggregate.phase,
            description: aggregate.description,
        })
    }

    async fn publish(
        &self,
        mut ctp: ChangeTransferPolicy,
        ready: Option<Condition>,
    ) -> Result<ChangeTransferPolicy> {
        if let Some(condition) = ready {
            set_condition(&mut ctp.status.conditions, condition);
        }
        Ok(typed::update_status(self.ctx.store(), &ctp).await?)
    }

    async fn reconcile_policy(&self, key: &ObjectKey) -> Result<Action> {
        let store = self.ctx.store();
        let Some(mut ctp) = typed::get_opt::<ChangeTransferPolicy>(store, key).await? else {
            return Ok(Action::Done);
        };
        ctp.spec.validate()?;

        let (repository, scm) = self
            .ctx
            .resolve_repository(&key.namespace, &ctp.spec.repository_reference)
            .await?;
        let repo = repository.repo_ref();
        let git = scm.git();
        let proposed_branch = ctp.spec.proposed_branch.clone();
        let active_branch = ctp.spec.active_branch.clone();

        let heads = git
            .ls_remote(&repo, &[proposed_branch.clone(), active_branch.clone()])
            .await?;
        let proposed_head = heads
            .get(&proposed_branch)
            .cloned()
            .ok_or_else(|| PromoterError::dependency("branch", &proposed_branch))?;
        let active_head = heads
            .get(&active_branch)
            .cloned()
            .ok_or_else(|| PromoterError::dependency("branch", &active_branch))?;

        // Forks of one repository share SHAs; only this repository's reports count.
        let records: Vec<CommitStatus> =
            typed::list::<CommitStatus>(store, Some(&key.namespace), None)
                .await?
                .into_iter()
                .filter(|r| r.spec.repository_reference == ctp.spec.repository_reference)
                .collect();
        let proposed_keys = ctp.spec.proposed_keys();
        let active_keys = ctp.spec.active_keys();
        let (proposed, mut active) = futures::try_join!(
            self.branch_state(
                git.as_ref(),
                &repo,
                &proposed_branch,
                &proposed_head,
                &proposed_keys,
                &records,
            ),
            self.branch_state(
                git.as_ref(),
                &repo,
                &active_branch,
                &active_head,
                &active_keys,
                &records,
            ),
        )?;

        let now = self.ctx.clock.now();
        let executor = PullRequestMirror::new(store, &scm, &repo, &ctp, now);
        let loaded: Option<PullRequest> = executor.load().await?;
        let mirror = match executor
            .refresh(loaded, self.ctx.config.change_transfer_policy_requeue())
            .await
        {
            Ok(mirror) => mirror,
            Err(err) => {
                ctp.status.proposed = proposed;
                ctp.status.active = active;
                self.publish(ctp, None).await?;
                return Err(err);
            }
        };
        let plan = plan_proposal(&ProposalInput {
            proposed_branch: &proposed_branch,
            active_branch: &active_branch,
            proposed: &proposed,
            active: &active,
            auto_merge: ctp.spec.auto_merge,
            ceiling: ctp.spec.promotion_ceiling.as_ref(),
            mirror: mirror.as_ref(),
        });
        if let Some(reason) = &plan.blocked_reason {
            obs::emit_promotion_blocked(&active_branch, reason);
        }
        debug!(actions = plan.actions.len(), phase = ?plan.phase, "planned pull request actions");

        let outcome = executor.apply(mirror, plan.actions, &proposed_head).await;

        // Observed branch state is published even when the SCM call failed.
        let generation = ctp.metadata.generation;
        ctp.status.proposed = proposed;
        ctp.status.blocked_reason = plan.blocked_reason.clone();

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                ctp.status.active = active;
                ctp.status.phase = plan.phase;
                self.publish(ctp, None).await?;
                return Err(err);
            }
        };

        let mut phase = plan.phase;
        if outcome.merged {
            phase = ProposalPhase::Merged;
            let heads = git.ls_remote(&repo, &[active_branch.clone()]).await?;
            if let Some(head) = heads.get(&active_branch) {
                active = self
                    .branch_state(
                        git.as_ref(),
                        &repo,
                        &active_branch,
                        head,
                        &active_keys,
                        &records,
                    )
                    .await?;
            }
        } else if outcome.closed_externally {
            phase = ProposalPhase::Closed;
        }
        obs::emit_proposal_phase(&active_branch, phase);

        ctp.status.active = active;
        ctp.status.phase = phase;
        ctp.status.pull_request = outcome.mirror.as_ref().map(|pr| PullRequestSummary {
            id: pr.status.id.clone(),
            state: pr.status.state,
            url: pr.status.url.clone(),
        });
        let message = match &plan.blocked_reason {
            Some(reason) => format!("{phase:?}: {reason}"),
            None => format!("{phase:?}"),
        };
        let ready = Condition::ready(
            ConditionStatus::True,
            reasons::RECONCILIATION_SUCCESS,
            message,
            generation,
            now,
        );
        self.publish(ctp, Some(ready)).await?;

        Ok(Action::RequeueAfter(
            self.ctx.config.change_transfer_policy_requeue(),
        ))
    }
}

#[async_trait]
impl Reconciler for ChangeTransferPolicyReconciler {
    fn kind(&self) -> &'static str {
        ChangeTransferPolicy::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let span = obs::reconcile_span(self.kind(), key);
        self.reconcile_policy(key).instrument(span).await
    }

    async fn record_failure(&self, key: &ObjectKey, error: &PromoterError) -> Result<()> {
        record_ready_failure::<ChangeTransferPolicy>(
            self.ctx.store(),
            self.ctx.clock.as_ref(),
            key,
            error,
        )
        .await
    }
}

/// Enqueues every ChangeTransferPolicy in the namespace of a changed
/// CommitStatus.
pub struct CommitStatusMapper {
    ctx: ReconcileContext,
}

impl CommitStatusMapper {
    pub fn new(ctx: ReconcileContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventMapper for CommitStatusMapper {
    fn source_kind(&self) -> &'static str {
        CommitStatus::KIND
    }

    async fn map(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        let namespace = &event.metadata.namespace;
        match typed::list::<ChangeTransferPolicy>(self.ctx.store(), Some(namespace), None).await {
            Ok(policies) => policies.iter().map(|p| p.key()).collect(),
            Err(err) => {
                warn!(namespace = %namespace, error = %err, "failed to list ChangeTransferPolicies");
                Vec::new()
            }
        }
    }
}
