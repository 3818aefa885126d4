//! Error taxonomy for the promoter.
//!
//! Every failure a reconcile can hit maps onto one [`ErrorClass`], which
//! decides how the runtime retries it and what the `Ready` condition says.

use std::time::Duration;

use promoter_store::StoreError;

use crate::api::reasons;
use crate::git::GitError;
use crate::scm::ScmError;

/// How a failure is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network hiccups, rate limits, write conflicts. Retried with backoff.
    Transient,
    /// The user must change an object. Not retried on a timer; the next
    /// change to the object triggers a new attempt.
    Configuration,
    /// A referenced object or branch does not exist yet. Retried on a slow
    /// fixed interval.
    DependencyNotFound,
    /// Internal inconsistency. Logged loudly and retried with backoff.
    Invariant,
}

#[derive(Debug, thiserror::Error)]
pub enum PromoterError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("git error: {0}")]
    Git(#[from] GitError),

    #[error("scm error: {0}")]
    Scm(#[from] ScmError),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("{kind} {name} not found")]
    DependencyNotFound { kind: String, name: String },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reconcile timed out after {0:?}")]
    Timeout(Duration),
}

impl PromoterError {
    pub fn dependency(kind: impl Into<String>, name: impl Into<String>) -> Self {
        PromoterError::DependencyNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PromoterError::Store(err) => match err {
                StoreError::NotFound { .. } => ErrorClass::DependencyNotFound,
                StoreError::Conflict { .. } | StoreError::Backend(_) => ErrorClass::Transient,
                StoreError::InvalidSelector(_) => ErrorClass::Configuration,
                StoreError::AlreadyExists { .. } => ErrorClass::Transient,
                StoreError::KindMismatch { .. } | StoreError::Serialization(_) => {
                    ErrorClass::Invariant
                }
            },
            PromoterError::Git(err) => match err {
                GitError::NotFound(_) => ErrorClass::DependencyNotFound,
                GitError::AuthFailure(_) => ErrorClass::Configuration,
                GitError::Network(_) | GitError::Command(_) => ErrorClass::Transient,
            },
            PromoterError::Scm(err) => {
                if err.is_transient() {
                    ErrorClass::Transient
                } else {
                    match err {
                        ScmError::Auth(_)
                        | ScmError::Unsupported(_)
                        | ScmError::Configuration(_) => ErrorClass::Configuration,
                        ScmError::NotFound(_) => ErrorClass::DependencyNotFound,
                        _ => ErrorClass::Transient,
                    }
                }
            }
            PromoterError::Configuration(_) => ErrorClass::Configuration,
            PromoterError::DependencyNotFound { .. } => ErrorClass::DependencyNotFound,
            PromoterError::Invariant(_) | PromoterError::Serialization(_) => ErrorClass::Invariant,
            PromoterError::Io(_) | PromoterError::Timeout(_) => ErrorClass::Transient,
        }
    }

    /// Reason recorded on the `Ready` condition.
    pub fn reason(&self) -> &'static str {
        match self.class() {
            ErrorClass::Transient => reasons::TRANSIENT_ERROR,
            ErrorClass::Configuration => reasons::VALIDATION_FAILED,
            ErrorClass::DependencyNotFound => reasons::DEPENDENCY_NOT_FOUND,
            ErrorClass::Invariant => reasons::RECONCILIATION_ERROR,
        }
    }
}

/// Result type for promoter operations.
pub type Result<T> = std::result::Result<T, PromoterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_classify() {
        let missing = PromoterError::from(StoreError::NotFound {
            kind: "GitRepository".to_string(),
            key: "default/repo".to_string(),
        });
        assert_eq!(missing.class(), ErrorClass::DependencyNotFound);

        let conflict = PromoterError::from(StoreError::Conflict {
            kind: "ChangeTransferPolicy".to_string(),
            key: "default/dev".to_string(),
            expected: 3,
            actual: 4,
        });
        assert_eq!(conflict.class(), ErrorClass::Transient);
        assert_eq!(conflict.reason(), reasons::TRANSIENT_ERROR);
    }

    #[test]
    fn test_git_and_scm_errors_classify() {
        assert_eq!(
            PromoterError::from(GitError::AuthFailure("denied".to_string())).class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            PromoterError::from(GitError::Network("reset".to_string())).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            PromoterError::from(ScmError::RateLimited("slow down".to_string())).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            PromoterError::from(ScmError::Auth("bad token".to_string())).class(),
            ErrorClass::Configuration
        );
    }

    #[test]
    fn test_retryable_git_errors_are_transient() {
        for err in [
            GitError::NotFound("repo".to_string()),
            GitError::AuthFailure("denied".to_string()),
            GitError::Network("reset".to_string()),
            GitError::Command("index.lock exists".to_string()),
        ] {
            let retryable = err.is_retryable();
            let class = PromoterError::from(err).class();
            assert_eq!(retryable, class == ErrorClass::Transient, "{class:?}");
        }
    }

    #[test]
    fn test_dependency_error_display() {
        let err = PromoterError::dependency("branch", "environment/dev-next");
        assert_eq!(err.to_string(), "branch environment/dev-next not found");
        assert_eq!(err.reason(), reasons::DEPENDENCY_NOT_FOUND);
    }
}
