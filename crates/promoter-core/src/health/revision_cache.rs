//! Last seen sync revision per Application.
//!
//! Deployment tools rewrite Application status many times a second while a
//! sync is in flight. The cache lets the watch mapper drop events that carry
//! the same revision as last time unless the health changed recently.
//!
//! Entries are never evicted. The cache holds one short string per
//! Application the controller has seen, a number bounded by what operators
//! deploy.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use promoter_store::ObjectKey;

use crate::metrics::METRICS;

/// Events for an unchanged revision are still enqueued this long after the
/// last health transition.
pub const SUPPRESSION_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct RevisionCache {
    revisions: RwLock<HashMap<ObjectKey, String>>,
}

impl RevisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a change to `key` should trigger a reconcile.
    ///
    /// True when `revision` differs from the last one seen, or the health
    /// transitioned less than [`SUPPRESSION_WINDOW`] before `now`. Records
    /// `revision` whenever it returns true.
    pub fn should_enqueue(
        &self,
        key: &ObjectKey,
        revision: &str,
        last_transition: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let unchanged = {
            let revisions = self.revisions.read().unwrap_or_else(|p| p.into_inner());
            revisions.get(key).is_some_and(|seen| seen == revision)
        };
        let settled = match last_transition {
            None => true,
            Some(at) => {
                now.signed_duration_since(at).num_milliseconds()
                    >= SUPPRESSION_WINDOW.as_millis() as i64
            }
        };
        if unchanged && settled {
            METRICS.inc_suppressed_workload_events();
            return false;
        }

        let mut revisions = self.revisions.write().unwrap_or_else(|p| p.into_inner());
        revisions.insert(key.clone(), revision.to_string());
        true
    }

    pub fn get(&self, key: &ObjectKey) -> Option<String> {
        self.revisions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.revisions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
