//! Error types for promoter-store

use thiserror::Error;

/// Errors returned by an [`ObjectStore`](crate::ObjectStore) backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The object does not exist.
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    /// An object with the same kind, namespace and name already exists.
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },

    /// Optimistic-concurrency precondition failed.
    #[error("conflict updating {kind} {key}: expected resource version {expected}, found {actual}")]
    Conflict {
        kind: String,
        key: String,
        expected: u64,
        actual: u64,
    },

    /// The stored kind does not match the requested resource type.
    #[error("kind mismatch: expected {expected}, found {actual}")]
    KindMismatch { expected: String, actual: String },

    /// A label selector could not be evaluated.
    #[error("invalid label selector: {0}")]
    InvalidSelector(String),

    /// Serialization to or from the stored representation failed.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The backend itself failed (connection loss, poisoned lock, ...).
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// True for optimistic-concurrency conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// True when retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Backend(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
