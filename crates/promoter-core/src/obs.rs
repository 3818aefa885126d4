//! Structured lifecycle events for the promoter.
//!
//! Every reconcile runs inside a [`reconcile_span`] so log lines carry the
//! kind and key of the object being reconciled. The `emit_*` functions log
//! the externally visible side effects at `info!` with a stable `event`
//! field.

use promoter_store::ObjectKey;
use tracing::{info, warn};

use crate::api::{CommitPhase, ProposalPhase};

/// Span for one reconcile of `kind` `key`. Attach with
/// `tracing::Instrument::instrument` so it survives `.await` points.
pub fn reconcile_span(kind: &str, key: &ObjectKey) -> tracing::Span {
    tracing::info_span!(
        "promoter.reconcile",
        kind = %kind,
        namespace = %key.namespace,
        name = %key.name,
    )
}

pub fn emit_reconcile_started(kind: &str, key: &ObjectKey) {
    tracing::debug!(event = "reconcile.started", kind = %kind, key = %key);
}

pub fn emit_reconcile_finished(kind: &str, key: &ObjectKey, duration_ms: u64, success: bool) {
    info!(
        event = "reconcile.finished",
        kind = %kind,
        key = %key,
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_reconcile_failed(kind: &str, key: &ObjectKey, error: &dyn std::fmt::Display) {
    warn!(event = "reconcile.failed", kind = %kind, key = %key, error = %error);
}

/// `action` is one of `created`, `updated`, `merged`, `closed`.
pub fn emit_pull_request(action: &str, source: &str, target: &str, id: &str) {
    info!(
        event = %format!("pull_request.{action}"),
        source_branch = %source,
        target_branch = %target,
        pull_request = %id,
    );
}

pub fn emit_proposal_phase(branch: &str, phase: ProposalPhase) {
    tracing::debug!(event = "proposal.phase", branch = %branch, phase = ?phase);
}

pub fn emit_promotion_blocked(branch: &str, reason: &str) {
    info!(event = "promotion.blocked", branch = %branch, reason = %reason);
}

pub fn emit_commit_status_published(name: &str, sha: &str, phase: CommitPhase) {
    info!(
        event = "commit_status.published",
        commit_status = %name,
        sha = %sha,
        phase = %phase,
    );
}
