//! Promoter Core Library
//!
//! Promotion state machine for the GitOps promoter: moves a tested commit
//! through an ordered chain of environment branches by opening, updating and
//! merging pull requests.

pub mod aggregate;
pub mod api;
pub mod change_transfer;
pub mod clock;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod git;
pub mod health;
pub mod metrics;
pub mod naming;
pub mod obs;
pub mod promotion;
pub mod pull_request;
pub mod scm;
pub mod telemetry;

pub use aggregate::{
    aggregate_commit_statuses, apply_settling_window, Aggregate, PhaseCounts, SETTLING_WINDOW,
};
pub use change_transfer::{ChangeTransferPolicyReconciler, CommitStatusMapper};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PromoterConfig;
pub use context::ReconcileContext;
pub use controller::manager::OwnerMapper;
pub use controller::{Action, EventMapper, Manager, ManagerHandle, Reconciler, WorkQueue};
pub use error::{ErrorClass, PromoterError, Result};
pub use git::{CliGit, GitError, GitOperations, GitPaths, GitRemote};
pub use health::{
    ApplicationMapper, HealthBridgeReconciler, RevisionCache, HEALTH_STATUS_KEY,
    SUPPRESSION_WINDOW,
};
pub use metrics::METRICS;
pub use promotion::{validate_strategy, PromotionStrategyReconciler, HEALTHY_HISTORY_LEN};
pub use pull_request::{plan_proposal, PullRequestAction, PullRequestMirror};
pub use scm::{FakeForge, RepoRef, ScmClient, ScmError, ScmResolver};

use std::sync::Arc;

use api::{ChangeTransferPolicy, PromotionStrategy, PullRequest};
use promoter_store::Resource;

/// A [`Manager`] with every reconciler and watch mapping registered.
pub fn build_manager(ctx: &ReconcileContext) -> Manager {
    let revisions = Arc::new(RevisionCache::new());
    Manager::new(ctx.store.clone(), ctx.config.clone())
        .with_git_paths(ctx.scm.paths().clone())
        .register(
            Arc::new(PromotionStrategyReconciler::new(ctx.clone())),
            vec![Arc::new(OwnerMapper::new(
                ChangeTransferPolicy::KIND,
                PromotionStrategy::KIND,
            )) as Arc<dyn EventMapper>],
        )
        .register(
            Arc::new(ChangeTransferPolicyReconciler::new(ctx.clone())),
            vec![
                Arc::new(CommitStatusMapper::new(ctx.clone())) as Arc<dyn EventMapper>,
                Arc::new(OwnerMapper::new(PullRequest::KIND, ChangeTransferPolicy::KIND)),
            ],
        )
        .register(
            Arc::new(HealthBridgeReconciler::new(ctx.clone())),
            vec![Arc::new(ApplicationMapper::new(ctx.clone(), revisions)) as Arc<dyn EventMapper>],
        )
}
