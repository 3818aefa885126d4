//! Shared dependencies handed to every reconciler.

use std::sync::Arc;

use promoter_store::{typed, ObjectKey, ObjectStore};

use crate::api::{GitRepository, ObjectReference, ScmProvider, Secret};
use crate::clock::{Clock, SystemClock};
use crate::config::PromoterConfig;
use crate::error::{PromoterError, Result};
use crate::scm::{ScmClient, ScmResolver};

#[derive(Clone)]
pub struct ReconcileContext {
    pub store: Arc<dyn ObjectStore>,
    pub scm: Arc<ScmResolver>,
    pub config: Arc<PromoterConfig>,
    pub clock: Arc<dyn Clock>,
}

impl ReconcileContext {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        scm: Arc<ScmResolver>,
        config: Arc<PromoterConfig>,
    ) -> Self {
        Self {
            store,
            scm,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    /// Follow `GitRepository -> ScmProvider -> Secret` in `namespace` and
    /// build a client. Any missing link is a dependency-not-found error.
    pub async fn resolve_repository(
        &self,
        namespace: &str,
        reference: &ObjectReference,
    ) -> Result<(GitRepository, ScmClient)> {
        let repo: GitRepository =
            typed::get_opt(self.store(), &ObjectKey::new(namespace, &reference.name))
                .await?
                .ok_or_else(|| PromoterError::dependency("GitRepository", &reference.name))?;
        repo.validate()?;

        let provider_name = &repo.spec.scm_provider_ref.name;
        let provider: ScmProvider =
            typed::get_opt(self.store(), &ObjectKey::new(namespace, provider_name))
                .await?
                .ok_or_else(|| PromoterError::dependency("ScmProvider", provider_name))?;

        let secret_name = &provider.spec.secret_ref.name;
        let secret: Secret = if provider.spec.fake.is_some() && secret_name.is_empty() {
            Secret::default()
        } else {
            typed::get_opt(self.store(), &ObjectKey::new(namespace, secret_name))
                .await?
                .ok_or_else(|| PromoterError::dependency("Secret", secret_name))?
        };

        let client = self.scm.resolve(&provider, &secret)?;
        Ok((repo, client))
    }
}
