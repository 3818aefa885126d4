//! Registry of local git work directories.
//!
//! Every directory the git client materializes is registered here so the
//! process can remove them on shutdown. Each directory also gets an async
//! lock; fetches into the same directory are serialized.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

type DirLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Clone, Default)]
pub struct GitPaths {
    dirs: Arc<Mutex<BTreeMap<PathBuf, DirLock>>>,
}

impl GitPaths {
    pub fn new() -> Self {
        Self::default()
    }

    fn dirs(&self) -> MutexGuard<'_, BTreeMap<PathBuf, DirLock>> {
        self.dirs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `dir` and return its lock.
    pub fn register(&self, dir: &Path) -> DirLock {
        self.dirs()
            .entry(dir.to_path_buf())
            .or_insert_with(|| {
                debug!(path = %dir.display(), "git work dir registered");
                Arc::new(tokio::sync::Mutex::new(()))
            })
            .clone()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.dirs().keys().cloned().collect()
    }

    /// Remove every registered directory. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let dirs: Vec<PathBuf> = std::mem::take(&mut *self.dirs()).into_keys().collect();
        let mut removed = 0;
        for dir in dirs {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %dir.display(), error = %err, "failed to remove git work dir"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent_and_shares_lock() {
        let paths = GitPaths::new();
        let a = paths.register(Path::new("/tmp/promoter/a"));
        let b = paths.register(Path::new("/tmp/promoter/a"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(paths.paths().len(), 1);
    }

    #[test]
    fn test_cleanup_removes_registered_dirs() {
        let root = tempfile::tempdir().unwrap();
        let one = root.path().join("github.com/argoproj/deployments");
        let two = root.path().join("gitlab.com/team/config");
        std::fs::create_dir_all(&one).unwrap();
        std::fs::create_dir_all(&two).unwrap();

        let paths = GitPaths::new();
        paths.register(&one);
        paths.register(&two);
        paths.register(&root.path().join("never-created"));

        assert_eq!(paths.cleanup(), 2);
        assert!(!one.exists());
        assert!(!two.exists());
        assert!(paths.paths().is_empty());
    }
}
