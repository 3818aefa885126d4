//! Pull request lifecycle for one ChangeTransferPolicy.
//!
//! [`plan_proposal`] is pure: from the observed branch states and the local
//! mirror it decides which SCM calls are needed. [`PullRequestMirror`]
//! executes them and records each successful call in the mirror, so a
//! repeated reconcile with nothing new to do plans no calls at all. An open
//! mirror older than the resync period is re-read from the provider first.

use std::time::Duration;

use chrono::{DateTime, Utc};
use promoter_store::{typed, ObjectKey, ObjectMeta, ObjectStore, Resource};
use tracing::{debug, info};

use crate::api::change_transfer_policy::short_sha;
use crate::api::{
    ChangeTransferPolicy, CommitBranchState, CommitPhase, PromotionCeiling, ProposalPhase,
    PullRequest, PullRequestSpec, PullRequestState, PullRequestStatus, ENVIRONMENT_LABEL,
};
use crate::error::{PromoterError, Result};
use crate::naming;
use crate::obs;
use crate::scm::{PullRequestRequest, RepoRef, ScmClient, ScmError};

/// One side effect against the SCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullRequestAction {
    Create(PullRequestRequest),
    Update {
        id: String,
        request: PullRequestRequest,
    },
    Close {
        id: String,
    },
    /// Merge whichever pull request is open once the preceding actions ran.
    Merge,
}

/// Everything the planner looks at.
#[derive(Debug, Clone, Copy)]
pub struct ProposalInput<'a> {
    pub proposed_branch: &'a str,
    pub active_branch: &'a str,
    pub proposed: &'a CommitBranchState,
    pub active: &'a CommitBranchState,
    pub auto_merge: bool,
    pub ceiling: Option<&'a PromotionCeiling>,
    pub mirror: Option<&'a PullRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalPlan {
    pub actions: Vec<PullRequestAction>,
    pub phase: ProposalPhase,
    pub blocked_reason: Option<String>,
}

/// Whether the proposed branch carries anything the active branch lacks.
///
/// Equal hydrated SHAs mean no diff. So do equal dry SHAs: a merge commit on
/// the active branch has its own hydrated SHA but promotes the same dry
/// commit.
pub fn has_diff(proposed: &CommitBranchState, active: &CommitBranchState) -> bool {
    if proposed.hydrated.sha == active.hydrated.sha {
        return false;
    }
    let dry_known = !proposed.dry.sha.is_empty() && !active.dry.sha.is_empty();
    !(dry_known && proposed.dry.sha == active.dry.sha)
}

pub fn desired_request(input: &ProposalInput<'_>) -> PullRequestRequest {
    let dry = &input.proposed.dry;
    let shown = if dry.sha.is_empty() {
        &input.proposed.hydrated.sha
    } else {
        &dry.sha
    };
    let title = format!("Promote {} to `{}`", short_sha(shown), input.active_branch);

    let mut description = format!(
        "This PR promotes `{}` to `{}`.\n\n",
        input.proposed_branch, input.active_branch
    );
    if !dry.sha.is_empty() {
        description.push_str(&format!("Dry commit: {}", dry.sha));
        if !dry.subject.is_empty() {
            description.push_str(&format!(" ({})", dry.subject));
        }
        if !dry.author.is_empty() {
            description.push_str(&format!(" by {}", dry.author));
        }
        description.push('\n');
    }
    description.push_str(&format!(
        "Proposed hydrated commit: {}\nActive hydrated commit: {}\n",
        input.proposed.hydrated.sha, input.active.hydrated.sha
    ));

    PullRequestRequest {
        title,
        description,
        source_branch: input.proposed_branch.to_string(),
        target_branch: input.active_branch.to_string(),
    }
}

fn mirror_matches(mirror: &PullRequest, request: &PullRequestRequest, source_sha: &str) -> bool {
    mirror.spec.title == request.title
        && mirror.spec.description == request.description
        && mirror.spec.source_sha == source_sha
}

pub fn plan_proposal(input: &ProposalInput<'_>) -> ProposalPlan {
    let open = input.mirror.filter(|m| m.is_open());

    if !has_diff(input.proposed, input.active) {
        let actions = open
            .map(|m| {
                vec![PullRequestAction::Close {
                    id: m.status.id.clone(),
                }]
            })
            .unwrap_or_default();
        return ProposalPlan {
            actions,
            phase: ProposalPhase::NoProposal,
            blocked_reason: None,
        };
    }

    let request = desired_request(input);
    let source_sha = &input.proposed.hydrated.sha;
    let mut actions = Vec::new();
    match open {
        None => actions.push(PullRequestAction::Create(request)),
        Some(mirror) if !mirror_matches(mirror, &request, source_sha) => {
            actions.push(PullRequestAction::Update {
                id: mirror.status.id.clone(),
                request,
            })
        }
        Some(_) => {}
    }

    let passing = input.proposed.phase == CommitPhase::Success;
    let phase = if passing {
        ProposalPhase::ProposalPassing
    } else {
        ProposalPhase::ProposalOpen
    };

    let mut blocked_reason = None;
    if input.auto_merge && passing {
        match input.ceiling {
            Some(ceiling) if !ceiling.permits(&input.proposed.dry.sha) => {
                blocked_reason = Some(ceiling.blocked_reason(&input.proposed.dry.sha));
            }
            _ => actions.push(PullRequestAction::Merge),
        }
    }

    ProposalPlan {
        actions,
        phase,
        blocked_reason,
    }
}

/// Result of executing a plan.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub mirror: Option<PullRequest>,
    pub merged: bool,
    /// The provider reported the pull request closed without a merge.
    pub closed_externally: bool,
}

/// Executes [`PullRequestAction`]s and keeps the mirror in step.
pub struct PullRequestMirror<'a> {
    store: &'a dyn ObjectStore,
    scm: &'a ScmClient,
    repo: &'a RepoRef,
    owner: &'a ChangeTransferPolicy,
    now: DateTime<Utc>,
}

impl<'a> PullRequestMirror<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        scm: &'a ScmClient,
        repo: &'a RepoRef,
        owner: &'a ChangeTransferPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            scm,
            repo,
            owner,
            now,
        }
    }

    pub fn key(owner: &ChangeTransferPolicy) -> ObjectKey {
        ObjectKey::new(
            owner.metadata.namespace.clone(),
            naming::child_name(&owner.spec.active_branch, &owner.metadata.name),
        )
    }

    pub async fn load(&self) -> Result<Option<PullRequest>> {
        Ok(typed::get_opt(self.store, &Self::key(self.owner)).await?)
    }

    async fn write(
        &self,
        existing: Option<PullRequest>,
        spec: PullRequestSpec,
        status: PullRequestStatus,
    ) -> Result<PullRequest> {
        match existing {
            Some(mut pr) => {
                pr.spec = spec;
                let mut pr = typed::update(self.store, &pr).await?;
                pr.status = status;
                Ok(typed::update_status(self.store, &pr).await?)
            }
            None => {
                let key = Self::key(self.owner);
                let metadata = ObjectMeta::new(key.namespace, key.name)
                    .with_label(
                        ENVIRONMENT_LABEL,
                        naming::normalize(&self.owner.spec.active_branch),
                    )
                    .with_owner(self.owner.controller_reference());
                let pr = PullRequest {
                    metadata,
                    spec,
                    status,
                };
                Ok(typed::create(self.store, &pr).await?)
            }
        }
    }

    async fn set_state(&self, mut pr: PullRequest, state: PullRequestState) -> Result<PullRequest> {
        pr.status.state = state;
        pr.status.last_synced = Some(self.now);
        Ok(typed::update_status(self.store, &pr).await?)
    }

    fn is_stale(&self, pr: &PullRequest, max_age: Duration) -> bool {
        match pr.status.last_synced {
            None => true,
            Some(at) => (self.now - at).to_std().is_ok_and(|age| age >= max_age),
        }
    }

    /// Provider-side state of pull request `id`. A pull request the provider
    /// no longer knows counts as closed.
    async fn remote_state(&self, id: &str) -> Result<PullRequestState> {
        match self.scm.get_pull_request(self.repo, id).await {
            Ok(remote) => Ok(remote.state),
            Err(ScmError::NotFound(_)) => Ok(PullRequestState::Closed),
            Err(err) => Err(err.into()),
        }
    }

    /// Re-read an open mirror from the provider once it is older than
    /// `max_age`. Anything else is returned untouched, without SCM calls.
    pub async fn refresh(
        &self,
        mirror: Option<PullRequest>,
        max_age: Duration,
    ) -> Result<Option<PullRequest>> {
        let pr = match mirror {
            Some(pr) if pr.is_open() && self.is_stale(&pr, max_age) => pr,
            other => return Ok(other),
        };
        let state = self.remote_state(&pr.status.id).await?;
        if !state.is_open() {
            info!(id = %pr.status.id, state = ?state, "pull request changed outside the promoter");
        }
        Ok(Some(self.set_state(pr, state).await?))
    }

    fn spec_for(&self, request: &PullRequestRequest, source_sha: &str) -> PullRequestSpec {
        PullRequestSpec {
            repository_reference: self.owner.spec.repository_reference.clone(),
            title: request.title.clone(),
            description: request.description.clone(),
            source_branch: request.source_branch.clone(),
            target_branch: request.target_branch.clone(),
            source_sha: source_sha.to_string(),
        }
    }

    async fn create(
        &self,
        mirror: Option<PullRequest>,
        request: &PullRequestRequest,
        source_sha: &str,
    ) -> Result<PullRequest> {
        // A previous attempt may have created the pull request and failed
        // before recording it.
        let existing = self
            .scm
            .find_open_pull_request(self.repo, &request.source_branch, &request.target_branch)
            .await?;
        let remote = match existing {
            Some(found) => {
                debug!(id = %found.id, "adopting open pull request");
                self.scm
                    .update_pull_request(self.repo, &found.id, request)
                    .await?;
                found
            }
            None => self.scm.create_pull_request(self.repo, request).await?,
        };
        obs::emit_pull_request(
            "created",
            &request.source_branch,
            &request.target_branch,
            &remote.id,
        );
        let status = PullRequestStatus {
            id: remote.id,
            state: PullRequestState::Open,
            url: remote.url,
            created_at: remote.created_at,
            last_synced: Some(self.now),
        };
        self.write(mirror, self.spec_for(request, source_sha), status)
            .await
    }

    async fn merge(&self, mirror: PullRequest, head_sha: &str) -> Result<ApplyOutcome> {
        let id = mirror.status.id.clone();
        let remote = self.scm.get_pull_request(self.repo, &id).await?;
        match remote.state {
            PullRequestState::Open => {}
            PullRequestState::Merged => {
                let mirror = self.set_state(mirror, PullRequestState::Merged).await?;
                return Ok(ApplyOutcome {
                    mirror: Some(mirror),
                    merged: true,
                    closed_externally: false,
                });
            }
            PullRequestState::Closed => {
                info!(id = %id, "pull request was closed outside the promoter");
                let mirror = self.set_state(mirror, PullRequestState::Closed).await?;
                return Ok(ApplyOutcome {
                    mirror: Some(mirror),
                    merged: false,
                    closed_externally: true,
                });
            }
        }
        match remote.mergeable {
            Some(true) => {}
            Some(false) => {
                return Err(ScmError::NotMergeable(format!("pull request {id} has conflicts")).into())
            }
            None => {
                return Err(ScmError::NotMergeable(format!(
                    "mergeability of pull request {id} not computed yet"
                ))
                .into())
            }
        }

        self.scm
            .merge_pull_request(self.repo, &id, head_sha)
            .await?;
        obs::emit_pull_request(
            "merged",
            &mirror.spec.source_branch,
            &mirror.spec.target_branch,
            &id,
        );
        let mirror = self.set_state(mirror, PullRequestState::Merged).await?;
        Ok(ApplyOutcome {
            mirror: Some(mirror),
            merged: true,
            closed_externally: false,
        })
    }

    /// Run `actions` in order. Stops at the first failure; everything before
    /// it is already recorded in the mirror.
    pub async fn apply(
        &self,
        mut mirror: Option<PullRequest>,
        actions: Vec<PullRequestAction>,
        head_sha: &str,
    ) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        for action in actions {
            match action {
                PullRequestAction::Create(request) => {
                    mirror = Some(self.create(mirror.take(), &request, head_sha).await?);
                }
                PullRequestAction::Update { id, request } => {
                    match self.scm.update_pull_request(self.repo, &id, &request).await {
                        Ok(()) => {}
                        Err(ScmError::NotFound(message)) => {
                            // Gone on the provider side; the next reconcile opens a new one.
                            if let Some(pr) = mirror.take() {
                                self.set_state(pr, PullRequestState::Closed).await?;
                            }
                            return Err(ScmError::NotFound(message).into());
                        }
                        Err(err) => return Err(err.into()),
                    }
                    obs::emit_pull_request(
                        "updated",
                        &request.source_branch,
                        &request.target_branch,
                        &id,
                    );
                    let mut status = mirror
                        .as_ref()
                        .map(|m| m.status.clone())
                        .unwrap_or_default();
                    status.last_synced = Some(self.now);
                    mirror = Some(
                        self.write(mirror.take(), self.spec_for(&request, head_sha), status)
                            .await?,
                    );
                }
                PullRequestAction::Close { id } => {
                    // A hand merge also leaves the branches equal.
                    let remote = self.remote_state(&id).await?;
                    let state = if remote.is_open() {
                        match self.scm.close_pull_request(self.repo, &id).await {
                            Ok(()) | Err(ScmError::NotFound(_)) => {}
                            Err(err) => return Err(err.into()),
                        }
                        PullRequestState::Closed
                    } else {
                        debug!(id = %id, state = ?remote, "pull request already finished on the provider");
                        remote
                    };
                    if let Some(pr) = mirror.take() {
                        if remote.is_open() {
                            obs::emit_pull_request(
                                "closed",
                                &pr.spec.source_branch,
                                &pr.spec.target_branch,
                                &id,
                            );
                        }
                        mirror = Some(self.set_state(pr, state).await?);
                    }
                }
                PullRequestAction::Merge => {
                    let open = mirror.take().filter(|m| m.is_open()).ok_or_else(|| {
                        PromoterError::Invariant(format!(
                            "merge planned for {} without an open pull request",
                            self.owner.metadata.name
                        ))
                    })?;
                    let merged = self.merge(open, head_sha).await?;
                    mirror = merged.mirror.clone();
                    outcome.merged = merged.merged;
                    outcome.closed_externally = merged.closed_externally;
                }
            }
        }
        outcome.mirror = mirror;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CommitShaState, ObjectReference};

    fn state(hydrated: &str, dry: &str, phase: CommitPhase) -> CommitBranchState {
        CommitBranchState {
            hydrated: CommitShaState {
                sha: hydrated.to_string(),
                ..CommitShaState::default()
            },
            dry: CommitShaState {
                sha: dry.to_string(),
                subject: "bump web".to_string(),
                ..CommitShaState::default()
            },
            phase,
            ..CommitBranchState::default()
        }
    }

    fn input<'a>(
        proposed: &'a CommitBranchState,
        active: &'a CommitBranchState,
        mirror: Option<&'a PullRequest>,
    ) -> ProposalInput<'a> {
        ProposalInput {
            proposed_branch: "environment/dev-next",
            active_branch: "environment/dev",
            proposed,
            active,
            auto_merge: true,
            ceiling: None,
            mirror,
        }
    }

    fn open_mirror(request: &PullRequestRequest, source_sha: &str) -> PullRequest {
        PullRequest {
            metadata: ObjectMeta::new("default", "pr"),
            spec: PullRequestSpec {
                repository_reference: ObjectReference::new("repo"),
                title: request.title.clone(),
                description: request.description.clone(),
                source_branch: request.source_branch.clone(),
                target_branch: request.target_branch.clone(),
                source_sha: source_sha.to_string(),
            },
            status: PullRequestStatus {
                id: "7".to_string(),
                state: PullRequestState::Open,
                ..PullRequestStatus::default()
            },
        }
    }

    #[test]
    fn test_no_diff_when_dry_commits_match() {
        let proposed = state("h2", "abc123", CommitPhase::Success);
        let active = state("h-merge", "abc123", CommitPhase::Success);
        assert!(!has_diff(&proposed, &active));

        let unknown_dry = state("h-merge", "", CommitPhase::Success);
        assert!(has_diff(&proposed, &unknown_dry));
    }

    #[test]
    fn test_plan_creates_then_merges_when_passing() {
        let proposed = state("h2", "abc123", CommitPhase::Success);
        let active = state("h1", "000000", CommitPhase::Success);
        let plan = plan_proposal(&input(&proposed, &active, None));

        assert_eq!(plan.phase, ProposalPhase::ProposalPassing);
        assert!(matches!(plan.actions[0], PullRequestAction::Create(ref r) if r.title == "Promote abc123 to `environment/dev`"));
        assert_eq!(plan.actions[1], PullRequestAction::Merge);
    }

    #[test]
    fn test_plan_is_empty_when_mirror_matches() {
        let proposed = state("h2", "abc123", CommitPhase::Pending);
        let active = state("h1", "000000", CommitPhase::Success);
        let i = input(&proposed, &active, None);
        let mirror = open_mirror(&desired_request(&i), "h2");

        let plan = plan_proposal(&input(&proposed, &active, Some(&mirror)));
        assert!(plan.actions.is_empty());
        assert_eq!(plan.phase, ProposalPhase::ProposalOpen);
    }

    #[test]
    fn test_plan_updates_when_source_moves() {
        let old = state("h2", "abc123", CommitPhase::Pending);
        let active = state("h1", "000000", CommitPhase::Success);
        let mirror = open_mirror(&desired_request(&input(&old, &active, None)), "h2");

        let moved = state("h3", "def456", CommitPhase::Pending);
        let plan = plan_proposal(&input(&moved, &active, Some(&mirror)));
        assert!(matches!(
            plan.actions.as_slice(),
            [PullRequestAction::Update { id, request }] if id == "7" && request.title.contains("def456")
        ));
    }

    #[test]
    fn test_plan_closes_obsolete_pull_request() {
        let proposed = state("h1", "abc123", CommitPhase::Pending);
        let active = state("h1", "abc123", CommitPhase::Success);
        let mirror = open_mirror(&desired_request(&input(&proposed, &active, None)), "h1");

        let plan = plan_proposal(&input(&proposed, &active, Some(&mirror)));
        assert_eq!(plan.phase, ProposalPhase::NoProposal);
        assert_eq!(
            plan.actions,
            vec![PullRequestAction::Close { id: "7".to_string() }]
        );
    }

    #[test]
    fn test_ceiling_blocks_merge() {
        let proposed = state("h2", "abc123", CommitPhase::Success);
        let active = state("h1", "000000", CommitPhase::Success);
        let ceiling = PromotionCeiling {
            branch: "environment/dev".to_string(),
            dry_sha: "000000".to_string(),
            phase: CommitPhase::Success,
        };
        let mut i = input(&proposed, &active, None);
        i.ceiling = Some(&ceiling);

        let plan = plan_proposal(&i);
        assert!(!plan.actions.contains(&PullRequestAction::Merge));
        assert!(plan.blocked_reason.unwrap().contains("environment/dev"));
    }

    #[test]
    fn test_manual_merge_environments_never_merge() {
        let proposed = state("h2", "abc123", CommitPhase::Success);
        let active = state("h1", "000000", CommitPhase::Success);
        let mut i = input(&proposed, &active, None);
        i.auto_merge = false;
        let plan = plan_proposal(&i);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.phase, ProposalPhase::ProposalPassing);
    }
}
