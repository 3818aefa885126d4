//! Repository identity and SCM credentials.

use std::collections::BTreeMap;

use promoter_store::ObjectMeta;
use serde::{Deserialize, Serialize};

use super::{impl_resource, ObjectReference};
use crate::error::{PromoterError, Result};
use crate::scm::RepoRef;

/// A remote repository hosted by the provider named in `scmProviderRef`.
///
/// Owner, name and provider are immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitRepository {
    pub metadata: ObjectMeta,
    pub spec: GitRepositorySpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    pub owner: String,
    pub name: String,
    pub scm_provider_ref: ObjectReference,
}

impl_resource!(GitRepository, "GitRepository");

impl GitRepository {
    pub fn repo_ref(&self) -> RepoRef {
        RepoRef::new(self.spec.owner.clone(), self.spec.name.clone())
    }

    pub fn validate(&self) -> Result<()> {
        let spec = &self.spec;
        if spec.owner.trim().is_empty() || spec.name.trim().is_empty() {
            return Err(PromoterError::Configuration(format!(
                "GitRepository {} must set both owner and name",
                self.metadata.name
            )));
        }
        if spec.name.contains('/') {
            return Err(PromoterError::Configuration(format!(
                "GitRepository {} name '{}' must not contain '/'",
                self.metadata.name, spec.name
            )));
        }
        if spec.scm_provider_ref.name.is_empty() {
            return Err(PromoterError::Configuration(format!(
                "GitRepository {} is missing scmProviderRef",
                self.metadata.name
            )));
        }
        Ok(())
    }

    /// Admission check for an update from `self` to `next`.
    pub fn validate_update(&self, next: &GitRepository) -> Result<()> {
        next.validate()?;
        if self.spec != next.spec {
            return Err(PromoterError::Configuration(format!(
                "GitRepository {} is immutable: {}/{} via {} cannot become {}/{} via {}",
                self.metadata.name,
                self.spec.owner,
                self.spec.name,
                self.spec.scm_provider_ref.name,
                next.spec.owner,
                next.spec.name,
                next.spec.scm_provider_ref.name,
            )));
        }
        Ok(())
    }
}

/// SCM provider configuration. Exactly one provider block must be set; the
/// block that is present selects the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScmProvider {
    pub metadata: ObjectMeta,
    pub spec: ScmProviderSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScmProviderSpec {
    pub secret_ref: ObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<GitHubProviderSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitlab: Option<GitLabProviderSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forgejo: Option<ForgejoProviderSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fake: Option<FakeProviderSpec>,
}

impl_resource!(ScmProvider, "ScmProvider");

/// GitHub or GitHub Enterprise. `domain` defaults to github.com.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubProviderSpec {
    #[serde(default)]
    pub domain: Option<String>,
}

/// GitLab. `domain` defaults to gitlab.com.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitLabProviderSpec {
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgejoProviderSpec {
    pub domain: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeProviderSpec {
    #[serde(default)]
    pub domain: Option<String>,
}

/// Opaque credentials. Providers read the `token` key and, where the
/// provider needs one, `username`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl_resource!(Secret, "Secret");

impl Secret {
    pub fn value(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}
