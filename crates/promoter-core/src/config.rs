//! Controller configuration.
//!
//! Loaded from an optional TOML file, then overridden by `PROMOTER_*`
//! environment variables. Every field has a default, so an empty file (or no
//! file) is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PromoterError, Result};

pub const ENV_NAMESPACE: &str = "PROMOTER_NAMESPACE";
pub const ENV_WORK_DIR: &str = "PROMOTER_WORK_DIR";
pub const ENV_WORKERS: &str = "PROMOTER_WORKERS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromoterConfig {
    /// Namespace the controller itself runs in.
    pub controller_namespace: String,
    /// Concurrent reconciles per controller.
    pub workers: usize,
    pub reconcile_timeout_secs: u64,
    /// How long in-flight reconciles may run after shutdown is requested.
    pub shutdown_grace_secs: u64,
    pub requeue: RequeueConfig,
    pub git: GitConfig,
    pub scm: ScmConfig,
}

impl Default for PromoterConfig {
    fn default() -> Self {
        Self {
            controller_namespace: "promoter-system".to_string(),
            workers: 2,
            reconcile_timeout_secs: 60,
            shutdown_grace_secs: 10,
            requeue: RequeueConfig::default(),
            git: GitConfig::default(),
            scm: ScmConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequeueConfig {
    pub promotion_strategy_secs: u64,
    pub change_transfer_policy_secs: u64,
    pub argocd_commit_status_secs: u64,
    /// Retry interval while a referenced object or branch is missing.
    pub dependency_retry_secs: u64,
    /// Full relist of every controller's objects.
    pub resync_secs: u64,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            promotion_strategy_secs: 300,
            change_transfer_policy_secs: 300,
            argocd_commit_status_secs: 15,
            dependency_retry_secs: 10,
            resync_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub work_dir: PathBuf,
    pub command_timeout_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("promoter-git"),
            command_timeout_secs: 60,
        }
    }
}

impl GitConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScmConfig {
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ScmConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 30,
            user_agent: format!("gitops-promoter/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ScmConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl PromoterConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| PromoterError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PromoterError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// File (when given) plus process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, normally `std::env::var`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(ns) = lookup(ENV_NAMESPACE).filter(|v| !v.is_empty()) {
            self.controller_namespace = ns;
        }
        if let Some(dir) = lookup(ENV_WORK_DIR).filter(|v| !v.is_empty()) {
            self.git.work_dir = PathBuf::from(dir);
        }
        if let Some(workers) = lookup(ENV_WORKERS).filter(|v| !v.is_empty()) {
            self.workers = workers.parse().map_err(|_| {
                PromoterError::Configuration(format!("{ENV_WORKERS}={workers} is not a number"))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PromoterError::Configuration(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.reconcile_timeout_secs == 0 {
            return Err(PromoterError::Configuration(
                "reconcile_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.requeue.resync_secs == 0 {
            return Err(PromoterError::Configuration(
                "requeue.resync_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn promotion_strategy_requeue(&self) -> Duration {
        Duration::from_secs(self.requeue.promotion_strategy_secs)
    }

    pub fn change_transfer_policy_requeue(&self) -> Duration {
        Duration::from_secs(self.requeue.change_transfer_policy_secs)
    }

    pub fn argocd_commit_status_requeue(&self) -> Duration {
        Duration::from_secs(self.requeue.argocd_commit_status_secs)
    }

    pub fn dependency_retry(&self) -> Duration {
        Duration::from_secs(self.requeue.dependency_retry_secs)
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.requeue.resync_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = PromoterConfig::from_toml_str(
            r#"
            workers = 4

            [requeue]
            argocd_commit_status_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.argocd_commit_status_requeue(), Duration::from_secs(30));
        assert_eq!(config.promotion_strategy_requeue(), Duration::from_secs(300));
        assert_eq!(config.controller_namespace, "promoter-system");
    }

    #[test]
    fn test_env_overrides_win() {
        let env: HashMap<&str, &str> = [
            (ENV_NAMESPACE, "gitops"),
            (ENV_WORK_DIR, "/var/lib/promoter"),
            (ENV_WORKERS, "8"),
        ]
        .into_iter()
        .collect();
        let config = PromoterConfig::default()
            .with_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.controller_namespace, "gitops");
        assert_eq!(config.git.work_dir, PathBuf::from("/var/lib/promoter"));
        assert_eq!(config.workers, 8);
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        let err = PromoterConfig::default()
            .with_env_overrides(|k| (k == ENV_WORKERS).then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PROMOTER_WORKERS"));

        assert!(PromoterConfig::from_toml_str("workers = 0").is_err());
        assert!(PromoterConfig::from_toml_str("workers = \"two\"").is_err());
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("promoter.toml");
        std::fs::write(&path, "controller_namespace = \"ops\"\n").unwrap();
        let config = PromoterConfig::from_file(&path).unwrap();
        assert_eq!(config.controller_namespace, "ops");
    }
}
