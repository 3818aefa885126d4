//! JSON manifests for seeding the in-memory store.
//!
//! A manifest directory holds `*.json` files, each one object or an array of
//! objects tagged with `kind`. Applying a manifest creates the object or
//! overwrites its desired state; `Application` manifests also carry status,
//! since the deployment tool is the one reporting it.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use promoter_core::api::{
    Application, ArgoCDCommitStatus, ChangeTransferPolicy, CommitStatus, GitRepository,
    PromotionStrategy, ScmProvider, Secret,
};
use promoter_core::validate_strategy;
use promoter_store::{typed, ObjectStore, Resource};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
pub enum Manifest {
    GitRepository(GitRepository),
    ScmProvider(ScmProvider),
    Secret(Secret),
    PromotionStrategy(PromotionStrategy),
    ChangeTransferPolicy(ChangeTransferPolicy),
    CommitStatus(CommitStatus),
    ArgoCDCommitStatus(ArgoCDCommitStatus),
    Application(Application),
}

impl Manifest {
    pub fn kind(&self) -> &'static str {
        match self {
            Manifest::GitRepository(_) => GitRepository::KIND,
            Manifest::ScmProvider(_) => ScmProvider::KIND,
            Manifest::Secret(_) => Secret::KIND,
            Manifest::PromotionStrategy(_) => PromotionStrategy::KIND,
            Manifest::ChangeTransferPolicy(_) => ChangeTransferPolicy::KIND,
            Manifest::CommitStatus(_) => CommitStatus::KIND,
            Manifest::ArgoCDCommitStatus(_) => ArgoCDCommitStatus::KIND,
            Manifest::Application(_) => Application::KIND,
        }
    }

    pub fn name(&self) -> String {
        let key = match self {
            Manifest::GitRepository(r) => r.key(),
            Manifest::ScmProvider(r) => r.key(),
            Manifest::Secret(r) => r.key(),
            Manifest::PromotionStrategy(r) => r.key(),
            Manifest::ChangeTransferPolicy(r) => r.key(),
            Manifest::CommitStatus(r) => r.key(),
            Manifest::ArgoCDCommitStatus(r) => r.key(),
            Manifest::Application(r) => r.key(),
        };
        format!("{} {key}", self.kind())
    }
}

/// Parse one file: a single manifest or an array of them.
pub fn parse(raw: &str) -> Result<Vec<Manifest>> {
    let value: Value = serde_json::from_str(raw)?;
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value::<Manifest>(item).with_context(|| format!("manifest #{index}"))
        })
        .collect()
}

/// Every manifest under `dir`, files in name order.
pub fn load_dir(dir: &Path) -> Result<Vec<Manifest>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read manifest directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    let mut manifests = Vec::new();
    for file in files {
        let raw = std::fs::read_to_string(&file)
            .with_context(|| format!("cannot read {}", file.display()))?;
        let parsed = parse(&raw).with_context(|| format!("invalid manifest {}", file.display()))?;
        debug!(file = %file.display(), count = parsed.len(), "loaded manifests");
        manifests.extend(parsed);
    }
    Ok(manifests)
}

async fn upsert<R: Resource>(store: &dyn ObjectStore, desired: &R) -> Result<R> {
    match typed::get_opt::<R>(store, &desired.key()).await? {
        None => Ok(typed::create(store, desired).await?),
        Some(current) => {
            let mut next = desired.clone();
            let meta = next.metadata_mut();
            meta.uid = current.metadata().uid.clone();
            meta.resource_version = current.metadata().resource_version;
            Ok(typed::update(store, &next).await?)
        }
    }
}

/// Create or update the object a manifest describes.
pub async fn apply(store: &dyn ObjectStore, manifest: &Manifest) -> Result<()> {
    match manifest {
        Manifest::GitRepository(repo) => {
            repo.validate()?;
            if let Some(current) = typed::get_opt::<GitRepository>(store, &repo.key()).await? {
                current.validate_update(repo)?;
            }
            upsert(store, repo).await?;
        }
        Manifest::ScmProvider(r) => {
            upsert(store, r).await?;
        }
        Manifest::Secret(r) => {
            upsert(store, r).await?;
        }
        Manifest::PromotionStrategy(r) => {
            upsert(store, r).await?;
        }
        Manifest::ChangeTransferPolicy(r) => {
            upsert(store, r).await?;
        }
        Manifest::CommitStatus(r) => {
            upsert(store, r).await?;
        }
        Manifest::ArgoCDCommitStatus(r) => {
            upsert(store, r).await?;
        }
        Manifest::Application(app) => {
            let mut stored = upsert(store, app).await?;
            stored.status = app.status.clone();
            typed::update_status(store, &stored).await?;
        }
    }
    Ok(())
}

/// Apply every manifest, stopping at the first failure.
pub async fn apply_all(store: &dyn ObjectStore, manifests: &[Manifest]) -> Result<()> {
    for manifest in manifests {
        apply(store, manifest)
            .await
            .with_context(|| format!("failed to apply {}", manifest.name()))?;
    }
    info!(count = manifests.len(), "manifests applied");
    Ok(())
}

/// Problems a controller would report on these manifests, without running
/// one.
pub fn check(manifests: &[Manifest]) -> Vec<String> {
    let mut problems = Vec::new();
    let strategies: Vec<&PromotionStrategy> = manifests
        .iter()
        .filter_map(|m| match m {
            Manifest::PromotionStrategy(s) => Some(s),
            _ => None,
        })
        .collect();
    let repositories: Vec<&GitRepository> = manifests
        .iter()
        .filter_map(|m| match m {
            Manifest::GitRepository(r) => Some(r),
            _ => None,
        })
        .collect();

    for manifest in manifests {
        let result = match manifest {
            Manifest::GitRepository(repo) => repo.validate().map_err(|e| e.to_string()),
            Manifest::ScmProvider(provider) => check_provider(provider),
            Manifest::ChangeTransferPolicy(policy) => {
                policy.spec.validate().map_err(|e| e.to_string())
            }
            Manifest::ArgoCDCommitStatus(bridge) => bridge
                .spec
                .application_selector
                .validate()
                .map_err(|e| e.to_string()),
            Manifest::PromotionStrategy(strategy) => {
                let siblings: Vec<PromotionStrategy> =
                    strategies.iter().map(|s| (*s).clone()).collect();
                validate_strategy(strategy, &siblings)
                    .map_err(|e| e.to_string())
                    .and_then(|()| {
                        let wanted = &strategy.spec.repository_reference.name;
                        let found = repositories.iter().any(|r| {
                            r.metadata.namespace == strategy.metadata.namespace
                                && r.metadata.name == *wanted
                        });
                        if found {
                            Ok(())
                        } else {
                            Err(format!("GitRepository {wanted} is not defined"))
                        }
                    })
            }
            _ => Ok(()),
        };
        if let Err(problem) = result {
            problems.push(format!("{}: {problem}", manifest.name()));
        }
    }
    problems
}

fn check_provider(provider: &ScmProvider) -> std::result::Result<(), String> {
    let spec = &provider.spec;
    let configured = [
        spec.github.is_some(),
        spec.gitlab.is_some(),
        spec.forgejo.is_some(),
        spec.fake.is_some(),
    ]
    .into_iter()
    .filter(|set| *set)
    .count();
    if configured != 1 {
        return Err(format!(
            "exactly one provider block must be set, found {configured}"
        ));
    }
    Ok(())
}

/// Fail unless `manifests` pass [`check`].
pub fn ensure_valid(manifests: &[Manifest]) -> Result<()> {
    let problems = check(manifests);
    if !problems.is_empty() {
        bail!("{}", problems.join("\n"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use promoter_store::fakes::MemoryObjectStore;
    use promoter_store::ObjectKey;

    const REPO: &str = r#"{
        "kind": "GitRepository",
        "metadata": {"namespace": "default", "name": "deploy"},
        "spec": {"owner": "org", "name": "deploy", "scmProviderRef": {"name": "fake"}}
    }"#;

    const STRATEGY: &str = r#"{
        "kind": "PromotionStrategy",
        "metadata": {"namespace": "default", "name": "web"},
        "spec": {
            "repositoryReference": {"name": "deploy"},
            "environments": [
                {"branch": "environment/dev"},
                {"branch": "environment/prod", "autoMerge": false}
            ]
        }
    }"#;

    #[test]
    fn test_parse_single_and_array() {
        assert_eq!(parse(REPO).unwrap().len(), 1);
        let both = format!("[{REPO}, {STRATEGY}]");
        let parsed = parse(&both).unwrap();
        assert_eq!(parsed[0].kind(), "GitRepository");
        assert_eq!(parsed[1].name(), "PromotionStrategy default/web");
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        assert!(parse(r#"{"kind": "Deployment", "metadata": {"namespace": "a", "name": "b"}}"#).is_err());
    }

    #[test]
    fn test_load_dir_reads_json_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("10-repo.json"), REPO).unwrap();
        std::fs::write(dir.path().join("20-strategy.json"), STRATEGY).unwrap();
        std::fs::write(dir.path().join("README.md"), "not a manifest").unwrap();

        let manifests = load_dir(dir.path()).unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].kind(), "GitRepository");
    }

    #[test]
    fn test_check_reports_missing_repository_and_duplicates() {
        let strategy = parse(STRATEGY).unwrap();
        let problems = check(&strategy);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("GitRepository deploy is not defined"));

        let duplicate = STRATEGY.replace("environment/prod", "environment/dev");
        let mut manifests = parse(REPO).unwrap();
        manifests.extend(parse(&duplicate).unwrap());
        let problems = check(&manifests);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("more than once"));
    }

    #[test]
    fn test_check_provider_blocks() {
        let none = r#"{"kind": "ScmProvider", "metadata": {"namespace": "default", "name": "p"}, "spec": {"secretRef": {"name": "s"}}}"#;
        assert_eq!(check(&parse(none).unwrap()).len(), 1);
        let fake = r#"{"kind": "ScmProvider", "metadata": {"namespace": "default", "name": "p"}, "spec": {"secretRef": {"name": ""}, "fake": {}}}"#;
        assert!(check(&parse(fake).unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_apply_creates_then_updates() {
        let store = MemoryObjectStore::new();
        let mut manifests = parse(REPO).unwrap();
        manifests.extend(parse(STRATEGY).unwrap());
        apply_all(&store, &manifests).await.unwrap();

        let edited = STRATEGY.replace("\"autoMerge\": false", "\"autoMerge\": true");
        apply_all(&store, &parse(&edited).unwrap()).await.unwrap();

        let strategy: PromotionStrategy = typed::get(&store, &ObjectKey::new("default", "web"))
            .await
            .unwrap();
        assert_eq!(strategy.metadata.generation, 2);
        assert_eq!(strategy.spec.environments[1].auto_merge, Some(true));
    }

    #[tokio::test]
    async fn test_apply_rejects_repository_change() {
        let store = MemoryObjectStore::new();
        apply_all(&store, &parse(REPO).unwrap()).await.unwrap();

        let moved = REPO.replace("\"owner\": \"org\"", "\"owner\": \"other\"");
        let err = apply_all(&store, &parse(&moved).unwrap()).await.unwrap_err();
        assert!(format!("{err:#}").contains("immutable"));
    }
}
