//! Shared fixtures for reconciler integration tests: an in-memory store, a
//! fake forge and a manual clock wired into one `ReconcileContext`.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use promoter_core::api::{
    ChangeTransferPolicy, ChangeTransferPolicySpec, CommitPhase, CommitStatus,
    CommitStatusSelector, CommitStatusSpec, FakeProviderSpec, GitRepository, GitRepositorySpec,
    ObjectReference, ScmProvider, ScmProviderSpec, COMMIT_STATUS_LABEL,
};
use promoter_core::{
    FakeForge, GitPaths, ManualClock, PromoterConfig, ReconcileContext, RepoRef, ScmResolver,
};
use promoter_store::fakes::MemoryObjectStore;
use promoter_store::{typed, ObjectKey, ObjectMeta};

pub const NS: &str = "default";
pub const REPO_NAME: &str = "deploy";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub struct Harness {
    pub store: Arc<MemoryObjectStore>,
    pub forge: FakeForge,
    pub clock: Arc<ManualClock>,
    pub ctx: ReconcileContext,
    pub repo: RepoRef,
}

impl Harness {
    /// A context with a `deploy` repository served by the fake provider.
    pub async fn new() -> Self {
        let store = Arc::new(MemoryObjectStore::new());
        let forge = FakeForge::new();
        let config = PromoterConfig::default();
        let scm = ScmResolver::new(&config, GitPaths::default())
            .unwrap()
            .with_fake_forge(forge.clone());
        let clock = Arc::new(ManualClock::new(start_time()));
        let ctx = ReconcileContext::new(store.clone(), Arc::new(scm), Arc::new(config))
            .with_clock(clock.clone());

        let provider = ScmProvider {
            metadata: ObjectMeta::new(NS, "fake"),
            spec: ScmProviderSpec {
                fake: Some(FakeProviderSpec::default()),
                ..ScmProviderSpec::default()
            },
        };
        typed::create(store.as_ref(), &provider).await.unwrap();
        let repository = GitRepository {
            metadata: ObjectMeta::new(NS, REPO_NAME),
            spec: GitRepositorySpec {
                owner: "org".to_string(),
                name: REPO_NAME.to_string(),
                scm_provider_ref: ObjectReference::new("fake"),
            },
        };
        typed::create(store.as_ref(), &repository).await.unwrap();

        Self {
            store,
            forge,
            clock,
            ctx,
            repo: RepoRef::new("org", REPO_NAME),
        }
    }

    /// Seed `branch` with an active commit rendering `active_dry` and its
    /// `-next` branch with a hydrated commit rendering `proposed_dry`.
    pub fn seed_environment(&self, branch: &str, active_dry: &str, proposed_dry: &str) {
        self.forge
            .commit(&self.repo, branch, &format!("hydrate {active_dry}"), Some(active_dry));
        self.forge.commit(
            &self.repo,
            &format!("{branch}-next"),
            &format!("hydrate {proposed_dry}"),
            Some(proposed_dry),
        );
    }

    pub fn head(&self, branch: &str) -> String {
        self.forge.branch_head(&self.repo, branch).unwrap()
    }

    pub async fn create_policy(
        &self,
        name: &str,
        branch: &str,
        auto_merge: bool,
        proposed_keys: &[&str],
    ) -> ChangeTransferPolicy {
        let policy = ChangeTransferPolicy {
            metadata: ObjectMeta::new(NS, name),
            spec: ChangeTransferPolicySpec {
                repository_reference: ObjectReference::new(REPO_NAME),
                proposed_branch: format!("{branch}-next"),
                active_branch: branch.to_string(),
                auto_merge,
                active_commit_statuses: Vec::new(),
                proposed_commit_statuses: proposed_keys
                    .iter()
                    .map(|k| CommitStatusSelector::new(*k))
                    .collect(),
                promotion_ceiling: None,
            },
            status: Default::default(),
        };
        typed::create(self.store.as_ref(), &policy).await.unwrap()
    }

    pub async fn policy(&self, name: &str) -> ChangeTransferPolicy {
        typed::get(self.store.as_ref(), &ObjectKey::new(NS, name))
            .await
            .unwrap()
    }

    /// Create or overwrite the `key` report for `sha`.
    pub async fn report(&self, key: &str, sha: &str, phase: CommitPhase) {
        let name = format!("{key}-{}", &sha[..8]);
        let spec = CommitStatusSpec {
            repository_reference: ObjectReference::new(REPO_NAME),
            sha: sha.to_string(),
            name: key.to_string(),
            description: String::new(),
            phase,
            url: String::new(),
        };
        let store = self.store.as_ref();
        match typed::get_opt::<CommitStatus>(store, &ObjectKey::new(NS, &name))
            .await
            .unwrap()
        {
            Some(mut existing) => {
                existing.spec = spec;
                typed::update(store, &existing).await.unwrap();
            }
            None => {
                let status = CommitStatus {
                    metadata: ObjectMeta::new(NS, name).with_label(COMMIT_STATUS_LABEL, key),
                    spec,
                };
                typed::create(store, &status).await.unwrap();
            }
        }
    }
}
