//! Controller runtime.
//!
//! A [`Reconciler`] converges one object kind. The [`Manager`] feeds it keys
//! from a [`WorkQueue`], maps store watch events onto keys, bounds each
//! reconcile with a timeout and records failures on the object's `Ready`
//! condition.

pub mod manager;
pub mod queue;

use std::time::Duration;

use async_trait::async_trait;
use promoter_store::{typed, ObjectKey, ObjectStore, Resource};

use crate::api::{set_condition, Condition, ConditionStatus, HasConditions};
use crate::clock::Clock;
use crate::error::{PromoterError, Result};

pub use manager::{EventMapper, Manager, ManagerHandle};
pub use queue::WorkQueue;

/// What the runtime does with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Wait for the next watch event or resync.
    Done,
    RequeueAfter(Duration),
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Resource kind this reconciler owns.
    fn kind(&self) -> &'static str;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action>;

    /// Record a failed reconcile on the object. Errors here are logged and
    /// otherwise ignored.
    async fn record_failure(&self, key: &ObjectKey, error: &PromoterError) -> Result<()>;
}

/// Set `Ready=False` on `key` with the error's reason. Missing objects are
/// ignored.
pub async fn record_ready_failure<R>(
    store: &dyn ObjectStore,
    clock: &dyn Clock,
    key: &ObjectKey,
    error: &PromoterError,
) -> Result<()>
where
    R: Resource + HasConditions,
{
    let Some(mut object) = typed::get_opt::<R>(store, key).await? else {
        return Ok(());
    };
    let generation = object.metadata().generation;
    let changed = set_condition(
        object.conditions_mut(),
        Condition::ready(
            ConditionStatus::False,
            error.reason(),
            error.to_string(),
            generation,
            clock.now(),
        ),
    );
    if changed {
        typed::update_status(store, &object).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        ready_condition, reasons, ChangeTransferPolicy, ChangeTransferPolicySpec,
        ObjectReference,
    };
    use crate::clock::SystemClock;
    use promoter_store::fakes::MemoryObjectStore;
    use promoter_store::ObjectMeta;

    #[tokio::test]
    async fn test_record_ready_failure_sets_reason() {
        let store = MemoryObjectStore::new();
        let ctp = ChangeTransferPolicy {
            metadata: ObjectMeta::new("default", "dev"),
            spec: ChangeTransferPolicySpec {
                repository_reference: ObjectReference::new("repo"),
                proposed_branch: "environment/dev-next".to_string(),
                active_branch: "environment/dev".to_string(),
                auto_merge: true,
                active_commit_statuses: Vec::new(),
                proposed_commit_statuses: Vec::new(),
                promotion_ceiling: None,
            },
            status: Default::default(),
        };
        let created = typed::create(&store, &ctp).await.unwrap();

        let err = PromoterError::dependency("GitRepository", "repo");
        record_ready_failure::<ChangeTransferPolicy>(&store, &SystemClock, &created.key(), &err)
            .await
            .unwrap();

        let stored: ChangeTransferPolicy = typed::get(&store, &created.key()).await.unwrap();
        let ready = ready_condition(&stored.status.conditions).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, reasons::DEPENDENCY_NOT_FOUND);
        assert!(ready.message.contains("GitRepository repo"));
    }

    #[tokio::test]
    async fn test_record_ready_failure_ignores_missing_object() {
        let store = MemoryObjectStore::new();
        let err = PromoterError::Invariant("boom".to_string());
        record_ready_failure::<ChangeTransferPolicy>(
            &store,
            &SystemClock,
            &ObjectKey::new("default", "gone"),
            &err,
        )
        .await
        .unwrap();
    }
}
