//! Storage trait definitions for the promoter
//!
//! The store works on type-erased [`StoredObject`]s so that the trait stays
//! object-safe and can be shared as `Arc<dyn ObjectStore>`. Concrete resource
//! types implement [`Resource`] and go through the helpers in
//! [`typed`](crate::typed).
//!
//! Guarantees every backend must honour:
//! - `create` assigns `uid`, `resource_version` and `generation = 1`.
//! - `update` / `update_status` fail with `Conflict` when the caller's
//!   `resource_version` is stale (a version of 0 skips the precondition).
//! - `update` never touches status; `update_status` touches nothing else.
//! - `generation` changes only when the desired state (`body`) changes.
//! - A write that changes nothing returns the current object unchanged and
//!   emits no watch event.
//! - `delete` cascades to every object whose owner references name the
//!   deleted object's uid.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::meta::{LabelSelector, ObjectKey, ObjectMeta, OwnerReference};

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A concrete resource kind that can be persisted in an [`ObjectStore`].
///
/// The serialized form must be a JSON object with a `metadata` field and,
/// optionally, a `status` field. Every other field is desired state.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.metadata().key()
    }

    /// Owner reference pointing at this object, for children it manages.
    fn controller_reference(&self) -> OwnerReference {
        OwnerReference {
            kind: Self::KIND.to_string(),
            name: self.metadata().name.clone(),
            uid: self.metadata().uid.clone(),
            controller: true,
        }
    }
}

/// Type-erased stored object: metadata, desired state and observed status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub kind: String,
    pub metadata: ObjectMeta,
    /// Every serialized field except `metadata` and `status`.
    pub body: serde_json::Value,
    /// The serialized `status` field, `Null` when absent.
    pub status: serde_json::Value,
}

impl StoredObject {
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Split a resource into metadata, body and status.
    pub fn from_resource<R: Resource>(resource: &R) -> StoreResult<Self> {
        let mut value = serde_json::to_value(resource)?;
        let fields = value.as_object_mut().ok_or_else(|| {
            StoreError::Serialization(format!("{} did not serialize to an object", R::KIND))
        })?;
        fields.remove("metadata");
        let status = fields.remove("status").unwrap_or(serde_json::Value::Null);
        Ok(Self {
            kind: R::KIND.to_string(),
            metadata: resource.metadata().clone(),
            body: value,
            status,
        })
    }

    /// Reassemble the concrete resource.
    pub fn into_resource<R: Resource>(self) -> StoreResult<R> {
        if self.kind != R::KIND {
            return Err(StoreError::KindMismatch {
                expected: R::KIND.to_string(),
                actual: self.kind,
            });
        }
        let mut value = self.body;
        let fields = value.as_object_mut().ok_or_else(|| {
            StoreError::Serialization(format!("stored {} body is not an object", R::KIND))
        })?;
        fields.insert("metadata".to_string(), serde_json::to_value(&self.metadata)?);
        if !self.status.is_null() {
            fields.insert("status".to_string(), self.status);
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Kind of change reported by [`ObjectStore::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// Change notification. Carries enough metadata to map the change onto
/// reconcile keys without another read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub kind: String,
    pub metadata: ObjectMeta,
}

/// Declarative object store.
///
/// Backend-agnostic and async. The in-memory implementation in
/// [`fakes`](crate::fakes) honours the full contract.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one object. Returns `StoreError::NotFound` if absent.
    async fn get(&self, kind: &str, key: &ObjectKey) -> StoreResult<StoredObject>;

    /// List objects of `kind`, optionally restricted to a namespace and a
    /// label selector. Results are ordered by namespace then name.
    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> StoreResult<Vec<StoredObject>>;

    /// Create a new object. Fails with `AlreadyExists` on a name clash.
    async fn create(&self, object: StoredObject) -> StoreResult<StoredObject>;

    /// Replace metadata labels, owner references and body. Status is kept.
    async fn update(&self, object: StoredObject) -> StoreResult<StoredObject>;

    /// Replace status only.
    async fn update_status(&self, object: StoredObject) -> StoreResult<StoredObject>;

    /// Delete an object and, transitively, everything it owns.
    async fn delete(&self, kind: &str, key: &ObjectKey) -> StoreResult<()>;

    /// Subscribe to change notifications.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
