//! Promoter-Store: declarative object store contract for the GitOps promoter
//!
//! The promoter does not own its persistence. Objects live in a declarative
//! store supplied by the surrounding platform, which offers get/list/create/
//! update/delete by namespace and name, optimistic concurrency through
//! resource versions, owner-reference garbage collection and watch-based
//! change notification.
//!
//! ## Layer 0 - Data/Persistence
//!
//! This crate pins that contract down as a trait so that reconcilers can be
//! written against it and tested without a cluster.
//!
//! ## Key Components
//!
//! - `ObjectStore`: object-safe async store trait over type-erased objects
//! - `typed`: serde-backed helpers that read and write concrete resources
//! - `ObjectMeta` / `LabelSelector`: metadata and list filtering
//! - `fakes::MemoryObjectStore`: in-memory backend honouring the full contract

mod error;
pub mod fakes;
mod meta;
pub mod storage_traits;
pub mod typed;

pub use error::StoreError;
pub use meta::{
    LabelSelector, LabelSelectorRequirement, ObjectKey, ObjectMeta, OwnerReference,
    SelectorOperator,
};
pub use storage_traits::{
    ObjectStore, Resource, StoreResult, StoredObject, WatchEvent, WatchEventType,
};
