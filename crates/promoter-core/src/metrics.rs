//! Process-wide counters for the promoter.
//!
//! Counters are bumped at the call site and emitted together by
//! [`Metrics::flush`], which the controller runtime calls on every resync
//! tick and at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    reconciles: AtomicU64,
    reconcile_errors: AtomicU64,
    scm_calls: AtomicU64,
    git_calls: AtomicU64,
    suppressed_workload_events: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            reconciles: AtomicU64::new(0),
            reconcile_errors: AtomicU64::new(0),
            scm_calls: AtomicU64::new(0),
            git_calls: AtomicU64::new(0),
            suppressed_workload_events: AtomicU64::new(0),
        }
    }

    pub fn inc_reconciles(&self) {
        self.reconciles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconcile_errors(&self) {
        self.reconcile_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// One pull request API call against an SCM provider.
    pub fn inc_scm_calls(&self) {
        self.scm_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "scm_calls", "counter incremented");
    }

    /// One `git` subprocess.
    pub fn inc_git_calls(&self) {
        self.git_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "git_calls", "counter incremented");
    }

    /// A workload status change dropped by the revision cache.
    pub fn inc_suppressed_workload_events(&self) {
        self.suppressed_workload_events
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            reconciles = self.reconciles(),
            reconcile_errors = self.reconcile_errors(),
            scm_calls = self.scm_calls(),
            git_calls = self.git_calls(),
            suppressed_workload_events = self.suppressed_workload_events(),
        );
    }

    pub fn reconciles(&self) -> u64 {
        self.reconciles.load(Ordering::Relaxed)
    }

    pub fn reconcile_errors(&self) -> u64 {
        self.reconcile_errors.load(Ordering::Relaxed)
    }

    pub fn scm_calls(&self) -> u64 {
        self.scm_calls.load(Ordering::Relaxed)
    }

    pub fn git_calls(&self) -> u64 {
        self.git_calls.load(Ordering::Relaxed)
    }

    pub fn suppressed_workload_events(&self) -> u64 {
        self.suppressed_workload_events.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.reconciles.store(0, Ordering::Relaxed);
        self.reconcile_errors.store(0, Ordering::Relaxed);
        self.scm_calls.store(0, Ordering::Relaxed);
        self.git_calls.store(0, Ordering::Relaxed);
        self.suppressed_workload_events.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_reset() {
        let m = Metrics::new();
        m.inc_reconciles();
        m.inc_reconciles();
        m.inc_reconcile_errors();
        m.inc_scm_calls();
        m.inc_git_calls();
        m.inc_git_calls();
        m.inc_git_calls();
        m.inc_suppressed_workload_events();

        assert_eq!(m.reconciles(), 2);
        assert_eq!(m.reconcile_errors(), 1);
        assert_eq!(m.scm_calls(), 1);
        assert_eq!(m.git_calls(), 3);
        assert_eq!(m.suppressed_workload_events(), 1);

        m.reset();
        assert_eq!(m.reconciles(), 0);
        assert_eq!(m.git_calls(), 0);
    }
}
