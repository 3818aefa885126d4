//! Typed helpers over [`ObjectStore`].
//!
//! Reconcilers work with concrete resource structs; these functions do the
//! (de)serialization to and from [`StoredObject`].

use crate::meta::{LabelSelector, ObjectKey};
use crate::storage_traits::{ObjectStore, Resource, StoreResult, StoredObject};

pub async fn get<R: Resource>(store: &dyn ObjectStore, key: &ObjectKey) -> StoreResult<R> {
    store.get(R::KIND, key).await?.into_resource()
}

/// Like [`get`] but maps `NotFound` to `None`.
pub async fn get_opt<R: Resource>(
    store: &dyn ObjectStore,
    key: &ObjectKey,
) -> StoreResult<Option<R>> {
    match store.get(R::KIND, key).await {
        Ok(object) => Ok(Some(object.into_resource()?)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

pub async fn list<R: Resource>(
    store: &dyn ObjectStore,
    namespace: Option<&str>,
    selector: Option<&LabelSelector>,
) -> StoreResult<Vec<R>> {
    store
        .list(R::KIND, namespace, selector)
        .await?
        .into_iter()
        .map(StoredObject::into_resource)
        .collect()
}

pub async fn create<R: Resource>(store: &dyn ObjectStore, resource: &R) -> StoreResult<R> {
    store
        .create(StoredObject::from_resource(resource)?)
        .await?
        .into_resource()
}

pub async fn update<R: Resource>(store: &dyn ObjectStore, resource: &R) -> StoreResult<R> {
    store
        .update(StoredObject::from_resource(resource)?)
        .await?
        .into_resource()
}

pub async fn update_status<R: Resource>(store: &dyn ObjectStore, resource: &R) -> StoreResult<R> {
    store
        .update_status(StoredObject::from_resource(resource)?)
        .await?
        .into_resource()
}

pub async fn delete<R: Resource>(store: &dyn ObjectStore, key: &ObjectKey) -> StoreResult<()> {
    store.delete(R::KIND, key).await
}
