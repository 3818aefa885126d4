//! In-memory object store
//!
//! `MemoryObjectStore` satisfies the [`ObjectStore`] contract without any
//! external dependencies. It backs the test suites and the demo controller.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::StoreError;
use crate::meta::{LabelSelector, ObjectKey};
use crate::storage_traits::*;

const WATCH_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<(String, ObjectKey), StoredObject>,
    last_version: u64,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }
}

/// In-memory store backed by a `BTreeMap<(kind, key), object>`.
#[derive(Debug)]
pub struct MemoryObjectStore {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn emit(&self, event_type: WatchEventType, object: &StoredObject) {
        // No subscribers is fine.
        let _ = self.events.send(WatchEvent {
            event_type,
            kind: object.kind.clone(),
            metadata: object.metadata.clone(),
        });
    }

    fn check_version(current: &StoredObject, incoming: &StoredObject) -> StoreResult<()> {
        let expected = incoming.metadata.resource_version;
        if expected != 0 && expected != current.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: current.kind.clone(),
                key: current.key().to_string(),
                expected,
                actual: current.metadata.resource_version,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, kind: &str, key: &ObjectKey) -> StoreResult<StoredObject> {
        let state = self.lock()?;
        state
            .objects
            .get(&(kind.to_string(), key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_string(),
                key: key.to_string(),
            })
    }

    async fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> StoreResult<Vec<StoredObject>> {
        if let Some(selector) = selector {
            selector.validate()?;
        }
        let state = self.lock()?;
        Ok(state
            .objects
            .iter()
            .filter(|((k, key), _)| k == kind && namespace.map_or(true, |ns| key.namespace == ns))
            .filter(|(_, object)| selector.map_or(true, |s| s.matches(&object.metadata.labels)))
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(&self, mut object: StoredObject) -> StoreResult<StoredObject> {
        let mut state = self.lock()?;
        let id = (object.kind.clone(), object.key());
        if state.objects.contains_key(&id) {
            return Err(StoreError::AlreadyExists {
                kind: object.kind,
                key: id.1.to_string(),
            });
        }
        object.metadata.uid = uuid::Uuid::new_v4().to_string();
        object.metadata.resource_version = state.next_version();
        object.metadata.generation = 1;
        object.metadata.creation_timestamp = Some(Utc::now());
        state.objects.insert(id, object.clone());
        drop(state);

        debug!(kind = %object.kind, key = %object.key(), "object created");
        self.emit(WatchEventType::Added, &object);
        Ok(object)
    }

    async fn update(&self, object: StoredObject) -> StoreResult<StoredObject> {
        let mut state = self.lock()?;
        let id = (object.kind.clone(), object.key());
        let current = state
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: object.kind.clone(),
                key: id.1.to_string(),
            })?;
        Self::check_version(&current, &object)?;

        let body_changed = current.body != object.body;
        if !body_changed
            && current.metadata.labels == object.metadata.labels
            && current.metadata.owner_references == object.metadata.owner_references
        {
            return Ok(current);
        }

        let mut updated = current;
        updated.body = object.body;
        updated.metadata.labels = object.metadata.labels;
        updated.metadata.owner_references = object.metadata.owner_references;
        if body_changed {
            updated.metadata.generation += 1;
        }
        updated.metadata.resource_version = state.next_version();
        state.objects.insert(id, updated.clone());
        drop(state);

        self.emit(WatchEventType::Modified, &updated);
        Ok(updated)
    }

    async fn update_status(&self, object: StoredObject) -> StoreResult<StoredObject> {
        let mut state = self.lock()?;
        let id = (object.kind.clone(), object.key());
        let current = state
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: object.kind.clone(),
                key: id.1.to_string(),
            })?;
        Self::check_version(&current, &object)?;
        if current.status == object.status {
            return Ok(current);
        }

        let mut updated = current;
        updated.status = object.status;
        updated.metadata.resource_version = state.next_version();
        state.objects.insert(id, updated.clone());
        drop(state);

        self.emit(WatchEventType::Modified, &updated);
        Ok(updated)
    }

    async fn delete(&self, kind: &str, key: &ObjectKey) -> StoreResult<()> {
        let mut state = self.lock()?;
        let root = state
            .objects
            .remove(&(kind.to_string(), key.clone()))
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_string(),
                key: key.to_string(),
            })?;

        let mut deleted = vec![root.clone()];
        let mut pending: VecDeque<String> = VecDeque::from([root.metadata.uid.clone()]);
        while let Some(owner_uid) = pending.pop_front() {
            let children: Vec<(String, ObjectKey)> = state
                .objects
                .iter()
                .filter(|(_, o)| o.metadata.is_owned_by(&owner_uid))
                .map(|(id, _)| id.clone())
                .collect();
            for id in children {
                if let Some(child) = state.objects.remove(&id) {
                    pending.push_back(child.metadata.uid.clone());
                    deleted.push(child);
                }
            }
        }
        drop(state);

        for object in &deleted {
            debug!(kind = %object.kind, key = %object.key(), "object deleted");
            self.emit(WatchEventType::Deleted, object);
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
