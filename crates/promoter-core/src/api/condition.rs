//! `Ready` condition surface shared by every reconciled object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The only condition type the promoter publishes.
pub const READY: &str = "Ready";

/// Machine-readable reasons used on the `Ready` condition.
pub mod reasons {
    pub const RECONCILIATION_SUCCESS: &str = "ReconciliationSuccess";
    pub const RECONCILIATION_ERROR: &str = "ReconciliationError";
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    pub const DEPENDENCY_NOT_FOUND: &str = "DependencyNotFound";
    pub const TRANSIENT_ERROR: &str = "TransientError";
    pub const CHILD_NOT_READY: &str = "ChildNotReady";
    pub const WAITING_FOR_CHILDREN: &str = "WaitingForChildren";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub observed_generation: u64,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn ready(
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        observed_generation: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: READY.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            observed_generation,
            last_transition_time: now,
        }
    }
}

/// Objects whose status carries conditions.
pub trait HasConditions {
    fn conditions(&self) -> &[Condition];

    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

/// Insert or replace the condition of the same type.
///
/// `last_transition_time` only moves when `status` changes. Returns whether
/// anything changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut new: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status == new.status {
                new.last_transition_time = existing.last_transition_time;
            }
            if *existing == new {
                return false;
            }
            *existing = new;
            true
        }
        None => {
            conditions.push(new);
            true
        }
    }
}

pub fn ready_condition(conditions: &[Condition]) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == READY)
}
