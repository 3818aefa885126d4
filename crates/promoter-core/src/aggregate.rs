//! Commit status aggregation.
//!
//! Reduces the records reported for one commit to a single phase:
//! - a required key with no record for the SHA counts as pending
//! - any pending key keeps the aggregate pending, even next to a failure
//! - failure once every key has reported and at least one failed
//! - success when every key passed, including when no key is required
//!
//! Two records for the same key and SHA resolve to the more severe phase
//! (failure, then pending, then success).

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::api::{CommitPhase, CommitStatus, CommitStatusPhase};

/// Health changes younger than this are reported as pending.
pub const SETTLING_WINDOW: Duration = Duration::from_secs(5);

/// Per-phase tally of a set of checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseCounts {
    pub success: usize,
    pub failure: usize,
    pub pending: usize,
}

impl PhaseCounts {
    pub fn from_phases(phases: impl IntoIterator<Item = CommitPhase>) -> Self {
        let mut counts = Self::default();
        for phase in phases {
            match phase {
                CommitPhase::Success => counts.success += 1,
                CommitPhase::Failure => counts.failure += 1,
                CommitPhase::Pending => counts.pending += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.success + self.failure + self.pending
    }

    pub fn phase(&self) -> CommitPhase {
        if self.pending > 0 {
            CommitPhase::Pending
        } else if self.failure > 0 {
            CommitPhase::Failure
        } else {
            CommitPhase::Success
        }
    }

    /// `"2/3 checks passed, 1 pending"`. `noun` names the items, `passed`
    /// and `failed` the terminal outcomes.
    pub fn describe(&self, noun: &str, passed: &str, failed: &str) -> String {
        let mut text = format!("{}/{} {noun} {passed}", self.success, self.total());
        if self.pending > 0 {
            text.push_str(&format!(", {} pending", self.pending));
        }
        if self.failure > 0 {
            text.push_str(&format!(", {} {failed}", self.failure));
        }
        text
    }
}

/// Aggregate of the required checks on one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub phase: CommitPhase,
    pub description: String,
    pub counts: PhaseCounts,
    /// One entry per required key, in the order the keys were given.
    pub statuses: Vec<CommitStatusPhase>,
}

/// Aggregate `records` for the commit `sha` against the `required` keys.
pub fn aggregate_commit_statuses(
    required: &[String],
    sha: &str,
    records: &[CommitStatus],
) -> Aggregate {
    let mut by_key: BTreeMap<&str, &CommitStatus> = BTreeMap::new();
    for record in records.iter().filter(|r| !sha.is_empty() && r.spec.sha == sha) {
        let slot = by_key.entry(record.status_key()).or_insert(record);
        if record.spec.phase.severity() > slot.spec.phase.severity() {
            *slot = record;
        }
    }

    let mut seen: Vec<&str> = Vec::with_capacity(required.len());
    let mut statuses = Vec::with_capacity(required.len());
    for key in required {
        if seen.contains(&key.as_str()) {
            continue;
        }
        seen.push(key.as_str());
        statuses.push(match by_key.get(key.as_str()) {
            Some(record) => CommitStatusPhase {
                key: key.clone(),
                phase: record.spec.phase,
                description: record.spec.description.clone(),
                url: record.spec.url.clone(),
            },
            None => CommitStatusPhase {
                key: key.clone(),
                phase: CommitPhase::Pending,
                description: format!("waiting for {key} on {}", short(sha)),
                url: String::new(),
            },
        });
    }

    let counts = PhaseCounts::from_phases(statuses.iter().map(|s| s.phase));
    Aggregate {
        phase: counts.phase(),
        description: counts.describe("checks", "passed", "failed"),
        counts,
        statuses,
    }
}

/// Hold `phase` at pending while the most recent health transition is
/// younger than [`SETTLING_WINDOW`].
pub fn apply_settling_window(
    phase: CommitPhase,
    last_transition: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> CommitPhase {
    match last_transition {
        Some(at) if now.signed_duration_since(at).num_milliseconds()
            < SETTLING_WINDOW.as_millis() as i64 =>
        {
            CommitPhase::Pending
        }
        _ => phase,
    }
}

fn short(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}
