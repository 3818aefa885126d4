//! ChangeTransferPolicy reconciliation against the fake forge.

mod common;

use common::Harness;
use promoter_core::api::{
    ready_condition, reasons, CommitPhase, CommitStatus, CommitStatusSpec, ConditionStatus,
    ObjectReference, ProposalPhase, PullRequestState, COMMIT_STATUS_LABEL,
};
use promoter_core::{
    Action, ChangeTransferPolicyReconciler, ErrorClass, Reconciler,
};
use promoter_store::{typed, ObjectMeta, Resource};

const DEV: &str = "environment/dev";
const DEV_NEXT: &str = "environment/dev-next";
const OLD_DRY: &str = "0000000000000000000000000000000000000000";
const NEW_DRY: &str = "abc1230000000000000000000000000000000000";

async fn setup(auto_merge: bool, proposed_keys: &[&str]) -> (Harness, ChangeTransferPolicyReconciler) {
    let h = Harness::new().await;
    h.seed_environment(DEV, OLD_DRY, NEW_DRY);
    h.create_policy("dev", DEV, auto_merge, proposed_keys).await;
    let reconciler = ChangeTransferPolicyReconciler::new(h.ctx.clone());
    (h, reconciler)
}

#[tokio::test]
async fn opens_pull_request_for_new_dry_commit() {
    let (h, reconciler) = setup(false, &[]).await;
    let key = h.policy("dev").await.key();

    let action = reconciler.reconcile(&key).await.unwrap();
    assert!(matches!(action, Action::RequeueAfter(_)));

    let open = h.forge.open_pull_requests(&h.repo);
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].source_branch, DEV_NEXT);
    assert_eq!(open[0].target_branch, DEV);
    assert_eq!(open[0].title, "Promote abc1230 to `environment/dev`");

    let policy = h.policy("dev").await;
    assert_eq!(policy.status.proposed.dry.sha, NEW_DRY);
    assert_eq!(policy.status.active.dry.sha, OLD_DRY);
    assert_eq!(policy.status.proposed.hydrated.sha, h.head(DEV_NEXT));
    assert_eq!(policy.status.phase, ProposalPhase::ProposalPassing);
    let pr = policy.status.pull_request.unwrap();
    assert_eq!(pr.state, PullRequestState::Open);
    assert_eq!(pr.id, open[0].id.to_string());

    let ready = ready_condition(&policy.status.conditions).unwrap();
    assert_eq!(ready.status, ConditionStatus::True);
    assert_eq!(ready.reason, reasons::RECONCILIATION_SUCCESS);
}

#[tokio::test]
async fn second_reconcile_makes_no_scm_calls() {
    let (h, reconciler) = setup(false, &[]).await;
    let key = h.policy("dev").await.key();
    reconciler.reconcile(&key).await.unwrap();

    h.forge.reset_calls();
    reconciler.reconcile(&key).await.unwrap();

    assert!(h.forge.scm_calls().is_empty(), "{:?}", h.forge.scm_calls());
    assert_eq!(h.forge.pull_requests(&h.repo).len(), 1);
}

#[tokio::test]
async fn missing_required_check_holds_merge() {
    let (h, reconciler) = setup(true, &["security-scan"]).await;
    let key = h.policy("dev").await.key();
    let active_before = h.head(DEV);

    reconciler.reconcile(&key).await.unwrap();

    let policy = h.policy("dev").await;
    assert_eq!(policy.status.proposed.phase, CommitPhase::Pending);
    assert!(policy.status.proposed.description.contains("0/1"));
    assert_eq!(policy.status.phase, ProposalPhase::ProposalOpen);
    assert_eq!(h.head(DEV), active_before);
    assert_eq!(h.forge.open_pull_requests(&h.repo).len(), 1);
}

#[tokio::test]
async fn passing_check_merges_and_settles() {
    let (h, reconciler) = setup(true, &["security-scan"]).await;
    let key = h.policy("dev").await.key();
    reconciler.reconcile(&key).await.unwrap();

    h.report("security-scan", &h.head(DEV_NEXT), CommitPhase::Success)
        .await;
    reconciler.reconcile(&key).await.unwrap();

    assert_eq!(h.head(DEV), h.head(DEV_NEXT));
    let policy = h.policy("dev").await;
    assert_eq!(policy.status.phase, ProposalPhase::Merged);
    assert_eq!(policy.status.active.dry.sha, NEW_DRY);
    assert_eq!(
        policy.status.pull_request.unwrap().state,
        PullRequestState::Merged
    );

    h.forge.reset_calls();
    reconciler.reconcile(&key).await.unwrap();
    let policy = h.policy("dev").await;
    assert_eq!(policy.status.phase, ProposalPhase::NoProposal);
    assert!(h.forge.scm_calls().is_empty());
}

#[tokio::test]
async fn check_reported_for_another_repository_does_not_count() {
    let (h, reconciler) = setup(true, &["security-scan"]).await;
    let key = h.policy("dev").await.key();
    let head = h.head(DEV_NEXT);
    let fork = CommitStatus {
        metadata: ObjectMeta::new(common::NS, "fork-security-scan")
            .with_label(COMMIT_STATUS_LABEL, "security-scan"),
        spec: CommitStatusSpec {
            repository_reference: ObjectReference::new("deploy-fork"),
            sha: head.clone(),
            name: "security-scan".to_string(),
            description: String::new(),
            phase: CommitPhase::Success,
            url: String::new(),
        },
    };
    typed::create(h.store.as_ref(), &fork).await.unwrap();

    reconciler.reconcile(&key).await.unwrap();

    let policy = h.policy("dev").await;
    assert_eq!(policy.status.proposed.phase, CommitPhase::Pending);
    assert_ne!(h.head(DEV), head);

    h.report("security-scan", &head, CommitPhase::Success).await;
    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(h.head(DEV), head);
}

#[tokio::test]
async fn stale_check_for_old_head_does_not_count() {
    let (h, reconciler) = setup(true, &["security-scan"]).await;
    let key = h.policy("dev").await.key();
    let first_head = h.head(DEV_NEXT);
    h.report("security-scan", &first_head, CommitPhase::Success)
        .await;

    // The hydrator renders again before the controller runs.
    h.forge
        .commit(&h.repo, DEV_NEXT, "hydrate again", Some(NEW_DRY));
    reconciler.reconcile(&key).await.unwrap();

    let policy = h.policy("dev").await;
    assert_ne!(policy.status.proposed.hydrated.sha, first_head);
    assert_eq!(policy.status.proposed.phase, CommitPhase::Pending);
    assert_ne!(h.head(DEV), h.head(DEV_NEXT));
}

#[tokio::test]
async fn moved_proposed_branch_updates_pull_request() {
    let (h, reconciler) = setup(false, &[]).await;
    let key = h.policy("dev").await.key();
    reconciler.reconcile(&key).await.unwrap();

    let newer = "def4560000000000000000000000000000000000";
    h.forge.commit(&h.repo, DEV_NEXT, "hydrate def456", Some(newer));
    h.forge.reset_calls();
    reconciler.reconcile(&key).await.unwrap();

    let open = h.forge.open_pull_requests(&h.repo);
    assert_eq!(open.len(), 1);
    assert_eq!(h.forge.scm_calls(), vec![format!("update {}", open[0].id)]);
    assert_eq!(open[0].title, "Promote def4560 to `environment/dev`");
    assert_eq!(h.policy("dev").await.status.proposed.dry.sha, newer);
}

#[tokio::test]
async fn obsolete_pull_request_is_closed() {
    let (h, reconciler) = setup(false, &[]).await;
    let key = h.policy("dev").await.key();
    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(h.forge.open_pull_requests(&h.repo).len(), 1);

    // Someone promoted by hand.
    h.forge.set_branch(&h.repo, DEV, &h.head(DEV_NEXT));
    reconciler.reconcile(&key).await.unwrap();

    assert!(h.forge.open_pull_requests(&h.repo).is_empty());
    let policy = h.policy("dev").await;
    assert_eq!(policy.status.phase, ProposalPhase::NoProposal);
    assert_eq!(
        policy.status.pull_request.unwrap().state,
        PullRequestState::Closed
    );
}

#[tokio::test]
async fn hand_merged_pull_request_is_recorded_as_merged() {
    let (h, reconciler) = setup(false, &[]).await;
    let key = h.policy("dev").await.key();
    reconciler.reconcile(&key).await.unwrap();
    let id = h.forge.open_pull_requests(&h.repo)[0].id;

    h.forge.merge_externally(&h.repo, id);
    h.forge.reset_calls();
    reconciler.reconcile(&key).await.unwrap();

    let policy = h.policy("dev").await;
    assert_eq!(policy.status.phase, ProposalPhase::NoProposal);
    assert_eq!(
        policy.status.pull_request.unwrap().state,
        PullRequestState::Merged
    );
    assert_eq!(h.forge.scm_calls(), vec![format!("get {id}")]);
}

#[tokio::test]
async fn pull_request_closed_on_forge_is_replaced_after_resync_period() {
    let (h, reconciler) = setup(false, &[]).await;
    let key = h.policy("dev").await.key();
    reconciler.reconcile(&key).await.unwrap();
    let first = h.forge.open_pull_requests(&h.repo)[0].id;
    h.forge.close_externally(&h.repo, first);

    // A fresh mirror is trusted as-is.
    h.forge.reset_calls();
    reconciler.reconcile(&key).await.unwrap();
    assert!(h.forge.scm_calls().is_empty(), "{:?}", h.forge.scm_calls());

    h.clock.advance(chrono::Duration::minutes(5));
    reconciler.reconcile(&key).await.unwrap();

    let open = h.forge.open_pull_requests(&h.repo);
    assert_eq!(open.len(), 1);
    assert_ne!(open[0].id, first);
    let policy = h.policy("dev").await;
    assert_eq!(policy.status.phase, ProposalPhase::ProposalPassing);
    let pr = policy.status.pull_request.unwrap();
    assert_eq!(pr.state, PullRequestState::Open);
    assert_eq!(pr.id, open[0].id.to_string());

    // Open and freshly confirmed: quiet again.
    h.forge.reset_calls();
    reconciler.reconcile(&key).await.unwrap();
    assert!(h.forge.scm_calls().is_empty(), "{:?}", h.forge.scm_calls());
}

#[tokio::test]
async fn externally_closed_pull_request_is_reported() {
    let (h, reconciler) = setup(true, &["security-scan"]).await;
    let key = h.policy("dev").await.key();
    reconciler.reconcile(&key).await.unwrap();
    let id = h.forge.open_pull_requests(&h.repo)[0].id;

    h.forge.close_externally(&h.repo, id);
    h.report("security-scan", &h.head(DEV_NEXT), CommitPhase::Success)
        .await;
    reconciler.reconcile(&key).await.unwrap();

    let policy = h.policy("dev").await;
    assert_eq!(policy.status.phase, ProposalPhase::Closed);
    assert_ne!(h.head(DEV), h.head(DEV_NEXT));
}

#[tokio::test]
async fn unmergeable_pull_request_is_retried() {
    let (h, reconciler) = setup(true, &["security-scan"]).await;
    let key = h.policy("dev").await.key();
    reconciler.reconcile(&key).await.unwrap();
    let id = h.forge.open_pull_requests(&h.repo)[0].id;

    h.forge.set_mergeable(&h.repo, id, false);
    h.report("security-scan", &h.head(DEV_NEXT), CommitPhase::Success)
        .await;
    let err = reconciler.reconcile(&key).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transient);

    h.forge.set_mergeable(&h.repo, id, true);
    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(h.head(DEV), h.head(DEV_NEXT));
}

#[tokio::test]
async fn scm_failure_is_recorded_and_recovers() {
    let (h, reconciler) = setup(false, &[]).await;
    let key = h.policy("dev").await.key();

    h.forge.fail_next_scm_call("connection reset");
    let err = reconciler.reconcile(&key).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transient);
    reconciler.record_failure(&key, &err).await.unwrap();

    let policy = h.policy("dev").await;
    // Observed branch state is still published.
    assert_eq!(policy.status.proposed.dry.sha, NEW_DRY);
    let ready = ready_condition(&policy.status.conditions).unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, reasons::TRANSIENT_ERROR);
    assert!(h.forge.open_pull_requests(&h.repo).is_empty());

    reconciler.reconcile(&key).await.unwrap();
    let policy = h.policy("dev").await;
    let ready = ready_condition(&policy.status.conditions).unwrap();
    assert_eq!(ready.status, ConditionStatus::True);
    assert_eq!(h.forge.open_pull_requests(&h.repo).len(), 1);
}

#[tokio::test]
async fn missing_branch_is_dependency_not_found() {
    let h = Harness::new().await;
    h.forge.commit(&h.repo, DEV, "hydrate", Some(OLD_DRY));
    h.create_policy("dev", DEV, true, &[]).await;
    let reconciler = ChangeTransferPolicyReconciler::new(h.ctx.clone());

    let err = reconciler
        .reconcile(&h.policy("dev").await.key())
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::DependencyNotFound);
}

#[tokio::test]
async fn deleted_policy_is_done() {
    let h = Harness::new().await;
    let reconciler = ChangeTransferPolicyReconciler::new(h.ctx.clone());
    let key = promoter_store::ObjectKey::new(common::NS, "gone");
    assert!(matches!(
        reconciler.reconcile(&key).await.unwrap(),
        Action::Done
    ));
}
