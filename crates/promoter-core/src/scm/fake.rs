//! In-memory forge.
//!
//! `FakeForge` plays both the git remote and the pull request API for the
//! `fake` provider. Clones share state, so a test can hold one handle while
//! the controller uses another. Merging fast-forwards the target branch to
//! the source head.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::{PullRequestRequest, RepoRef, ScmError, ScmPullRequest};
use crate::api::PullRequestState;
use crate::git::{CommitMetadata, GitError, GitOperations, HydratorMetadata};

/// A pull request held by the fake forge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakePullRequest {
    pub id: u64,
    pub source_branch: String,
    pub target_branch: String,
    pub title: String,
    pub description: String,
    pub state: PullRequestState,
    pub mergeable: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct FakeCommit {
    metadata: CommitMetadata,
    hydrator: Option<HydratorMetadata>,
}

#[derive(Debug, Default)]
struct FakeRepo {
    branches: BTreeMap<String, String>,
    commits: HashMap<String, FakeCommit>,
    pulls: BTreeMap<u64, FakePullRequest>,
    next_pull: u64,
}

#[derive(Debug, Default)]
struct ForgeState {
    repos: HashMap<RepoRef, FakeRepo>,
    commit_seq: u64,
    scm_calls: Vec<String>,
    git_calls: u64,
    fail_next_scm_call: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeForge {
    state: Arc<Mutex<ForgeState>>,
}

impl FakeForge {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ForgeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -----------------------------------------------------------------------
    // Test controls
    // -----------------------------------------------------------------------

    /// Push a new commit onto `branch`. When `dry_sha` is given, the commit
    /// carries hydrator metadata naming it. Returns the new SHA.
    pub fn commit(&self, repo: &RepoRef, branch: &str, subject: &str, dry_sha: Option<&str>) -> String {
        let mut state = self.state();
        state.commit_seq += 1;
        let seq = state.commit_seq;
        let sha = hex::encode(Sha256::digest(format!("{repo}/{branch}/{seq}/{subject}")))
            [..40]
            .to_string();
        let now = Utc::now();
        let hydrator = dry_sha.map(|dry| HydratorMetadata {
            dry_sha: dry.to_string(),
            repo_url: format!("https://fake.forge/{repo}"),
            author: "Dev <dev@example.com>".to_string(),
            subject: subject.to_string(),
            body: String::new(),
            date: Some(now),
        });
        let repo_state = state.repos.entry(repo.clone()).or_default();
        repo_state.commits.insert(
            sha.clone(),
            FakeCommit {
                metadata: CommitMetadata {
                    sha: sha.clone(),
                    author: "Hydrator <hydrator@example.com>".to_string(),
                    subject: subject.to_string(),
                    body: String::new(),
                    commit_time: Some(now),
                },
                hydrator,
            },
        );
        repo_state.branches.insert(branch.to_string(), sha.clone());
        sha
    }

    pub fn set_branch(&self, repo: &RepoRef, branch: &str, sha: &str) {
        self.state()
            .repos
            .entry(repo.clone())
            .or_default()
            .branches
            .insert(branch.to_string(), sha.to_string());
    }

    pub fn branch_head(&self, repo: &RepoRef, branch: &str) -> Option<String> {
        self.state()
            .repos
            .get(repo)
            .and_then(|r| r.branches.get(branch).cloned())
    }

    pub fn pull_requests(&self, repo: &RepoRef) -> Vec<FakePullRequest> {
        self.state()
            .repos
            .get(repo)
            .map(|r| r.pulls.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn open_pull_requests(&self, repo: &RepoRef) -> Vec<FakePullRequest> {
        self.pull_requests(repo)
            .into_iter()
            .filter(|p| p.state.is_open())
            .collect()
    }

    /// Pull request API calls seen so far, as `"<verb> <id>"`.
    pub fn scm_calls(&self) -> Vec<String> {
        self.state().scm_calls.clone()
    }

    pub fn git_calls(&self) -> u64 {
        self.state().git_calls
    }

    pub fn reset_calls(&self) {
        let mut state = self.state();
        state.scm_calls.clear();
        state.git_calls = 0;
    }

    /// The next pull request API call fails with a network error.
    pub fn fail_next_scm_call(&self, message: &str) {
        self.state().fail_next_scm_call = Some(message.to_string());
    }

    pub fn set_mergeable(&self, repo: &RepoRef, id: u64, mergeable: bool) {
        if let Some(pr) = self
            .state()
            .repos
            .get_mut(repo)
            .and_then(|r| r.pulls.get_mut(&id))
        {
            pr.mergeable = mergeable;
        }
    }

    /// Close a pull request behind the controller's back.
    pub fn close_externally(&self, repo: &RepoRef, id: u64) {
        if let Some(pr) = self
            .state()
            .repos
            .get_mut(repo)
            .and_then(|r| r.pulls.get_mut(&id))
        {
            pr.state = PullRequestState::Closed;
        }
    }

    /// Merge a pull request by hand on the forge, fast-forwarding its target.
    pub fn merge_externally(&self, repo: &RepoRef, id: u64) {
        let mut state = self.state();
        let Some(r) = state.repos.get_mut(repo) else {
            return;
        };
        let Some((source, target)) = r
            .pulls
            .get(&id)
            .map(|pr| (pr.source_branch.clone(), pr.target_branch.clone()))
        else {
            return;
        };
        if let Some(head) = r.branches.get(&source).cloned() {
            r.branches.insert(target, head);
        }
        if let Some(pr) = r.pulls.get_mut(&id) {
            pr.state = PullRequestState::Merged;
        }
    }

    // -----------------------------------------------------------------------
    // Pull request API
    // -----------------------------------------------------------------------

    fn record(state: &mut ForgeState, call: String) -> Result<(), ScmError> {
        state.scm_calls.push(call);
        match state.fail_next_scm_call.take() {
            Some(message) => Err(ScmError::Network(message)),
            None => Ok(()),
        }
    }

    fn parse_id(id: &str) -> Result<u64, ScmError> {
        id.parse()
            .map_err(|_| ScmError::NotFound(format!("pull request {id}")))
    }

    fn to_scm(pr: &FakePullRequest, repo: &FakeRepo, full_name: &RepoRef) -> ScmPullRequest {
        ScmPullRequest {
            id: pr.id.to_string(),
            state: pr.state,
            url: format!("https://fake.forge/{full_name}/pulls/{}", pr.id),
            mergeable: Some(pr.mergeable),
            created_at: Some(pr.created_at),
            head_sha: repo.branches.get(&pr.source_branch).cloned(),
        }
    }

    pub(crate) fn create_pull_request(
        &self,
        repo: &RepoRef,
        request: &PullRequestRequest,
    ) -> Result<ScmPullRequest, ScmError> {
        let mut state = self.state();
        Self::record(&mut state, "create".to_string())?;
        let repo_state = state.repos.entry(repo.clone()).or_default();
        for branch in [&request.source_branch, &request.target_branch] {
            if !repo_state.branches.contains_key(branch) {
                return Err(ScmError::Api {
                    status: 422,
                    message: format!("branch {branch} does not exist"),
                });
            }
        }
        if repo_state.pulls.values().any(|p| {
            p.state.is_open()
                && p.source_branch == request.source_branch
                && p.target_branch == request.target_branch
        }) {
            return Err(ScmError::AlreadyExists(format!(
                "{} -> {}",
                request.source_branch, request.target_branch
            )));
        }
        repo_state.next_pull += 1;
        let pr = FakePullRequest {
            id: repo_state.next_pull,
            source_branch: request.source_branch.clone(),
            target_branch: request.target_branch.clone(),
            title: request.title.clone(),
            description: request.description.clone(),
            state: PullRequestState::Open,
            mergeable: true,
            created_at: Utc::now(),
        };
        repo_state.pulls.insert(pr.id, pr.clone());
        Ok(Self::to_scm(&pr, repo_state, repo))
    }

    fn with_pull<T>(
        &self,
        repo: &RepoRef,
        verb: &str,
        id: &str,
        f: impl FnOnce(&mut FakeRepo, u64) -> Result<T, ScmError>,
    ) -> Result<T, ScmError> {
        let mut state = self.state();
        Self::record(&mut state, format!("{verb} {id}"))?;
        let number = Self::parse_id(id)?;
        let repo_state = state
            .repos
            .get_mut(repo)
            .filter(|r| r.pulls.contains_key(&number))
            .ok_or_else(|| ScmError::NotFound(format!("pull request {id} in {repo}")))?;
        f(repo_state, number)
    }

    pub(crate) fn update_pull_request(
        &self,
        repo: &RepoRef,
        id: &str,
        request: &PullRequestRequest,
    ) -> Result<(), ScmError> {
        self.with_pull(repo, "update", id, |r, number| {
            if let Some(pr) = r.pulls.get_mut(&number) {
                pr.title = request.title.clone();
                pr.description = request.description.clone();
            }
            Ok(())
        })
    }

    pub(crate) fn merge_pull_request(
        &self,
        repo: &RepoRef,
        id: &str,
        head_sha: &str,
    ) -> Result<(), ScmError> {
        self.with_pull(repo, "merge", id, |r, number| {
            let (source, target, state, mergeable) = match r.pulls.get(&number) {
                Some(pr) => (
                    pr.source_branch.clone(),
                    pr.target_branch.clone(),
                    pr.state,
                    pr.mergeable,
                ),
                None => return Err(ScmError::NotFound(format!("pull request {number}"))),
            };
            if !state.is_open() {
                return Err(ScmError::Api {
                    status: 405,
                    message: format!("pull request {number} is {state:?}"),
                });
            }
            if !mergeable {
                return Err(ScmError::NotMergeable(format!("pull request {number}")));
            }
            let head = r.branches.get(&source).cloned().unwrap_or_default();
            if head != head_sha {
                return Err(ScmError::NotMergeable(format!(
                    "head of {source} is {head}, expected {head_sha}"
                )));
            }
            r.branches.insert(target, head);
            if let Some(pr) = r.pulls.get_mut(&number) {
                pr.state = PullRequestState::Merged;
            }
            Ok(())
        })
    }

    pub(crate) fn close_pull_request(&self, repo: &RepoRef, id: &str) -> Result<(), ScmError> {
        self.with_pull(repo, "close", id, |r, number| {
            if let Some(pr) = r.pulls.get_mut(&number) {
                if pr.state.is_open() {
                    pr.state = PullRequestState::Closed;
                }
            }
            Ok(())
        })
    }

    pub(crate) fn get_pull_request(
        &self,
        repo: &RepoRef,
        id: &str,
    ) -> Result<ScmPullRequest, ScmError> {
        self.with_pull(repo, "get", id, |r, number| {
            r.pulls
                .get(&number)
                .map(|pr| Self::to_scm(pr, r, repo))
                .ok_or_else(|| ScmError::NotFound(format!("pull request {number}")))
        })
    }

    pub(crate) fn find_open_pull_request(
        &self,
        repo: &RepoRef,
        source: &str,
        target: &str,
    ) -> Result<Option<ScmPullRequest>, ScmError> {
        let mut state = self.state();
        Self::record(&mut state, format!("find {source}->{target}"))?;
        Ok(state.repos.get(repo).and_then(|r| {
            r.pulls
                .values()
                .find(|p| p.state.is_open() && p.source_branch == source && p.target_branch == target)
                .map(|p| Self::to_scm(p, r, repo))
        }))
    }
}

#[async_trait]
impl GitOperations for FakeForge {
    async fn ls_remote(
        &self,
        repo: &RepoRef,
        branches: &[String],
    ) -> Result<HashMap<String, String>, GitError> {
        let mut state = self.state();
        state.git_calls += 1;
        let repo_state = state
            .repos
            .get(repo)
            .ok_or_else(|| GitError::NotFound(format!("repository {repo}")))?;
        Ok(branches
            .iter()
            .filter_map(|b| repo_state.branches.get(b).map(|sha| (b.clone(), sha.clone())))
            .collect())
    }

    async fn read_commit(
        &self,
        repo: &RepoRef,
        _branch: &str,
        sha: &str,
    ) -> Result<CommitMetadata, GitError> {
        let mut state = self.state();
        state.git_calls += 1;
        state
            .repos
            .get(repo)
            .and_then(|r| r.commits.get(sha))
            .map(|c| c.metadata.clone())
            .ok_or_else(|| GitError::NotFound(format!("commit {sha} in {repo}")))
    }

    async fn read_hydrator_metadata(
        &self,
        repo: &RepoRef,
        _branch: &str,
        sha: &str,
    ) -> Result<Option<HydratorMetadata>, GitError> {
        let mut state = self.state();
        state.git_calls += 1;
        state
            .repos
            .get(repo)
            .and_then(|r| r.commits.get(sha))
            .map(|c| c.hydrator.clone())
            .ok_or_else(|| GitError::NotFound(format!("commit {sha} in {repo}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(source: &str, target: &str) -> PullRequestRequest {
        PullRequestRequest {
            title: "Promote".to_string(),
            description: String::new(),
            source_branch: source.to_string(),
            target_branch: target.to_string(),
        }
    }

    #[tokio::test]
    async fn merge_fast_forwards_target() {
        let forge = FakeForge::new();
        let repo = RepoRef::new("acme", "deploy");
        forge.commit(&repo, "env/dev", "initial", Some("old"));
        let head = forge.commit(&repo, "env/dev-next", "hydrate", Some("new"));

        let pr = forge
            .create_pull_request(&repo, &request("env/dev-next", "env/dev"))
            .unwrap();
        forge.merge_pull_request(&repo, &pr.id, &head).unwrap();

        assert_eq!(forge.branch_head(&repo, "env/dev").as_deref(), Some(head.as_str()));
        let pr = forge.get_pull_request(&repo, &pr.id).unwrap();
        assert_eq!(pr.state, PullRequestState::Merged);
        assert_eq!(forge.scm_calls(), vec!["create", "merge 1", "get 1"]);
    }

    #[tokio::test]
    async fn merge_refuses_moved_head() {
        let forge = FakeForge::new();
        let repo = RepoRef::new("acme", "deploy");
        forge.commit(&repo, "env/dev", "initial", None);
        let stale = forge.commit(&repo, "env/dev-next", "one", Some("a"));
        let pr = forge
            .create_pull_request(&repo, &request("env/dev-next", "env/dev"))
            .unwrap();
        forge.commit(&repo, "env/dev-next", "two", Some("b"));

        let err = forge.merge_pull_request(&repo, &pr.id, &stale).unwrap_err();
        assert!(matches!(err, ScmError::NotMergeable(_)));
    }

    #[tokio::test]
    async fn duplicate_open_pull_request_is_rejected() {
        let forge = FakeForge::new();
        let repo = RepoRef::new("acme", "deploy");
        forge.commit(&repo, "env/dev", "initial", None);
        forge.commit(&repo, "env/dev-next", "hydrate", Some("a"));
        forge
            .create_pull_request(&repo, &request("env/dev-next", "env/dev"))
            .unwrap();
        let err = forge
            .create_pull_request(&repo, &request("env/dev-next", "env/dev"))
            .unwrap_err();
        assert!(matches!(err, ScmError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn git_view_reports_heads_and_metadata() {
        let forge = FakeForge::new();
        let repo = RepoRef::new("acme", "deploy");
        let sha = forge.commit(&repo, "env/dev", "hydrate abc", Some("abc123"));

        let heads = forge
            .ls_remote(&repo, &["env/dev".to_string(), "env/missing".to_string()])
            .await
            .unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads["env/dev"], sha);

        let meta = forge
            .read_hydrator_metadata(&repo, "env/dev", &sha)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.dry_sha, "abc123");
    }

    #[test]
    fn injected_failure_hits_next_call_only() {
        let forge = FakeForge::new();
        let repo = RepoRef::new("acme", "deploy");
        forge.commit(&repo, "env/dev", "initial", None);
        forge.commit(&repo, "env/dev-next", "hydrate", Some("a"));
        forge.fail_next_scm_call("connection reset");

        let err = forge
            .create_pull_request(&repo, &request("env/dev-next", "env/dev"))
            .unwrap_err();
        assert!(err.is_transient());
        assert!(forge
            .create_pull_request(&repo, &request("env/dev-next", "env/dev"))
            .is_ok());
    }
}
