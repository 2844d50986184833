//! Sync Engine - Brings one local mirror up to date
//!
//! For each repository the engine decides between cloning, updating and
//! skipping, drives the [`GitTransport`] accordingly and records the result in
//! the [`MirrorStore`]. Transport and disk failures are caught here and turned
//! into a `failed` outcome; they never propagate to the orchestrator.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{CloneProtocol, Config};
use crate::error::{ExportError, TransportError};
use crate::git::{GitTransport, Remote};
use crate::github::RepositoryDescriptor;
use crate::store::MirrorStore;

/// What happened to one repository during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Cloned,
    Updated,
    Skipped,
    Failed,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncAction::Cloned => "cloned",
            SyncAction::Updated => "updated",
            SyncAction::Skipped => "skipped",
            SyncAction::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of syncing one repository
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub descriptor_id: i64,
    pub name: String,
    pub local_path: PathBuf,
    pub action: SyncAction,
    pub error_detail: Option<String>,
    pub duration: Duration,
}

impl SyncOutcome {
    pub fn is_failure(&self) -> bool {
        self.action == SyncAction::Failed
    }
}

/// Work the engine would do for a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedAction {
    /// No usable local mirror
    Clone,
    /// A repository exists at the path but the index has no record of it
    Adopt,
    /// Existing mirror, remote may have changed
    Update,
    /// Existing mirror, remote unchanged since the last successful sync
    Skip,
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlannedAction::Clone => "clone",
            PlannedAction::Adopt => "adopt",
            PlannedAction::Update => "update",
            PlannedAction::Skip => "skip",
        };
        f.write_str(s)
    }
}

/// Per-repository sync driver, shared by all workers of a run
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<MirrorStore>,
    transport: Arc<dyn GitTransport>,
    protocol: CloneProtocol,
    token: Option<String>,
    skip_unchanged: bool,
}

impl SyncEngine {
    pub fn new(store: Arc<MirrorStore>, transport: Arc<dyn GitTransport>) -> Self {
        Self {
            store,
            transport,
            protocol: CloneProtocol::Https,
            token: None,
            skip_unchanged: true,
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<MirrorStore>,
        transport: Arc<dyn GitTransport>,
        token: Option<String>,
    ) -> Self {
        Self {
            store,
            transport,
            protocol: config.sync.protocol,
            token,
            skip_unchanged: config.sync.skip_unchanged,
        }
    }

    pub fn with_protocol(mut self, protocol: CloneProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_skip_unchanged(mut self, skip_unchanged: bool) -> Self {
        self.skip_unchanged = skip_unchanged;
        self
    }

    pub fn store(&self) -> &Arc<MirrorStore> {
        &self.store
    }

    /// Decide what [`sync`](Self::sync) would do, without touching the network
    pub fn plan(&self, descriptor: &RepositoryDescriptor) -> Result<(PlannedAction, PathBuf), ExportError> {
        let path = self.store.path_for(descriptor);
        let record = self.store.lookup(descriptor.id)?;
        let exists = self.transport.is_repository(&path);

        let action = match record {
            None if exists => PlannedAction::Adopt,
            None => PlannedAction::Clone,
            Some(_) if !exists => PlannedAction::Clone,
            Some(record) => {
                let unchanged = record.remote_updated_at == Some(descriptor.last_activity());
                if self.skip_unchanged && unchanged && record.last_sync_status.is_success() {
                    PlannedAction::Skip
                } else {
                    PlannedAction::Update
                }
            }
        };

        Ok((action, path))
    }

    /// Bring the mirror of `descriptor` up to date.
    ///
    /// Always returns an outcome. A failure to read or write the index is
    /// reported as a failed outcome for this repository.
    pub async fn sync(&self, descriptor: &RepositoryDescriptor) -> SyncOutcome {
        let started = Instant::now();

        let (planned, path) = match self.plan(descriptor) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Index lookup failed for {}: {}", descriptor.full_name, e);
                return self.outcome(
                    descriptor,
                    self.store.path_for(descriptor),
                    SyncAction::Failed,
                    Some(e.to_string()),
                    started,
                );
            }
        };

        debug!("{}: {} at {}", descriptor.full_name, planned, path.display());

        let result = match planned {
            PlannedAction::Skip => Ok(SyncAction::Skipped),
            PlannedAction::Clone => {
                let remote = self.remote_for(descriptor);
                self.transport
                    .clone_repository(&remote, &path)
                    .await
                    .map(|_| SyncAction::Cloned)
            }
            PlannedAction::Adopt | PlannedAction::Update => {
                let remote = self.remote_for(descriptor);
                self.transport
                    .update_repository(&remote, &path)
                    .await
                    .map(|_| SyncAction::Updated)
            }
        };

        let mut outcome = match result {
            Ok(action) => {
                match action {
                    SyncAction::Skipped => debug!("{} unchanged, skipped", descriptor.full_name),
                    _ => info!("{} {}", descriptor.full_name, action),
                }
                self.outcome(descriptor, path, action, None, started)
            }
            Err(e) => {
                warn!("{} failed: {}", descriptor.full_name, e);
                self.outcome(descriptor, path, SyncAction::Failed, Some(describe(&e)), started)
            }
        };

        if let Err(e) = self.store.record(descriptor, &outcome) {
            warn!("Failed to record {} in the index: {}", descriptor.full_name, e);
            outcome.action = SyncAction::Failed;
            outcome.error_detail = Some(e.to_string());
        }

        outcome
    }

    /// Remote for the configured protocol, with credentials for HTTPS
    pub fn remote_for(&self, descriptor: &RepositoryDescriptor) -> Remote {
        let remote = match (self.protocol, &descriptor.ssh_url) {
            (CloneProtocol::Ssh, Some(ssh_url)) => Remote::plain(ssh_url.clone()),
            _ => match &self.token {
                Some(token) => Remote::with_token(descriptor.clone_url.clone(), token),
                None => Remote::plain(descriptor.clone_url.clone()),
            },
        };
        remote.default_branch(descriptor.default_branch.clone())
    }

    fn outcome(
        &self,
        descriptor: &RepositoryDescriptor,
        local_path: PathBuf,
        action: SyncAction,
        error_detail: Option<String>,
        started: Instant,
    ) -> SyncOutcome {
        SyncOutcome {
            descriptor_id: descriptor.id,
            name: descriptor.full_name.clone(),
            local_path,
            action,
            error_detail,
            duration: started.elapsed(),
        }
    }
}

/// Error text kept in the index and the report, including the source chain
fn describe(error: &TransportError) -> String {
    let mut detail = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !detail.contains(&cause_text) {
            detail.push_str(": ");
            detail.push_str(&cause_text);
        }
        source = cause.source();
    }
    detail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MirrorMode;
    use crate::git::MockGitTransport;
    use crate::store::SyncStatus;
    use chrono::{TimeZone, Utc};
    use std::path::Path;

    fn descriptor(id: i64, name: &str) -> RepositoryDescriptor {
        RepositoryDescriptor {
            id,
            name: name.to_string(),
            full_name: format!("octocat/{}", name),
            clone_url: format!("https://github.com/octocat/{}.git", name),
            ssh_url: Some(format!("git@github.com:octocat/{}.git", name)),
            default_branch: Some("main".to_string()),
            updated_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            pushed_at: None,
            is_private: true,
            is_fork: false,
            is_archived: false,
        }
    }

    fn store() -> Arc<MirrorStore> {
        Arc::new(MirrorStore::open_in_memory("/backup", MirrorMode::Mirror).unwrap())
    }

    fn engine(store: Arc<MirrorStore>, transport: MockGitTransport) -> SyncEngine {
        SyncEngine::new(store, Arc::new(transport))
    }

    #[tokio::test]
    async fn test_first_sync_clones_and_records() {
        let store = store();
        let mut transport = MockGitTransport::new();
        transport.expect_is_repository().return_const(false);
        transport
            .expect_clone_repository()
            .withf(|remote, dest| {
                remote.url == "https://github.com/octocat/a.git" && dest == Path::new("/backup/a.git")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        transport.expect_update_repository().never();

        let outcome = engine(store.clone(), transport).sync(&descriptor(1, "a")).await;

        assert_eq!(outcome.action, SyncAction::Cloned);
        assert_eq!(outcome.name, "octocat/a");
        assert!(outcome.error_detail.is_none());
        let record = store.lookup(1).unwrap().unwrap();
        assert_eq!(record.last_sync_status, SyncStatus::Cloned);
    }

    #[tokio::test]
    async fn test_unchanged_repository_is_skipped_without_transport_calls() {
        let store = store();
        let repo = descriptor(1, "a");

        let mut first = MockGitTransport::new();
        first.expect_is_repository().return_const(false);
        first.expect_clone_repository().returning(|_, _| Ok(()));
        engine(store.clone(), first).sync(&repo).await;

        let mut second = MockGitTransport::new();
        second.expect_is_repository().return_const(true);
        second.expect_clone_repository().never();
        second.expect_update_repository().never();

        let outcome = engine(store.clone(), second).sync(&repo).await;

        assert_eq!(outcome.action, SyncAction::Skipped);
        assert_eq!(
            store.lookup(1).unwrap().unwrap().last_sync_status,
            SyncStatus::Skipped
        );
    }

    #[tokio::test]
    async fn test_skip_disabled_updates_unchanged_repository() {
        let store = store();
        let repo = descriptor(1, "a");

        let mut first = MockGitTransport::new();
        first.expect_is_repository().return_const(false);
        first.expect_clone_repository().returning(|_, _| Ok(()));
        engine(store.clone(), first).sync(&repo).await;

        let mut second = MockGitTransport::new();
        second.expect_is_repository().return_const(true);
        second.expect_update_repository().times(1).returning(|_, _| Ok(()));

        let outcome = engine(store, second)
            .with_skip_unchanged(false)
            .sync(&repo)
            .await;

        assert_eq!(outcome.action, SyncAction::Updated);
    }

    #[tokio::test]
    async fn test_changed_repository_is_updated() {
        let store = store();
        let mut repo = descriptor(1, "a");

        let mut first = MockGitTransport::new();
        first.expect_is_repository().return_const(false);
        first.expect_clone_repository().returning(|_, _| Ok(()));
        engine(store.clone(), first).sync(&repo).await;

        repo.pushed_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());

        let mut second = MockGitTransport::new();
        second.expect_is_repository().return_const(true);
        second
            .expect_update_repository()
            .withf(|_, dest| dest == Path::new("/backup/a.git"))
            .times(1)
            .returning(|_, _| Ok(()));

        let outcome = engine(store.clone(), second).sync(&repo).await;

        assert_eq!(outcome.action, SyncAction::Updated);
        assert_eq!(
            store.lookup(1).unwrap().unwrap().remote_updated_at,
            repo.pushed_at
        );
    }

    #[tokio::test]
    async fn test_missing_mirror_is_cloned_again() {
        let store = store();
        let repo = descriptor(1, "a");

        let mut first = MockGitTransport::new();
        first.expect_is_repository().return_const(false);
        first.expect_clone_repository().returning(|_, _| Ok(()));
        engine(store.clone(), first).sync(&repo).await;

        let mut second = MockGitTransport::new();
        second.expect_is_repository().return_const(false);
        second.expect_clone_repository().times(1).returning(|_, _| Ok(()));

        let outcome = engine(store, second).sync(&repo).await;

        assert_eq!(outcome.action, SyncAction::Cloned);
    }

    #[tokio::test]
    async fn test_existing_unindexed_repository_is_adopted() {
        let store = store();
        let mut transport = MockGitTransport::new();
        transport.expect_is_repository().return_const(true);
        transport.expect_clone_repository().never();
        transport.expect_update_repository().times(1).returning(|_, _| Ok(()));

        let outcome = engine(store.clone(), transport).sync(&descriptor(1, "a")).await;

        assert_eq!(outcome.action, SyncAction::Updated);
        assert!(store.lookup(1).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transport_failure_becomes_failed_outcome() {
        let store = store();
        let mut transport = MockGitTransport::new();
        transport.expect_is_repository().return_const(false);
        transport.expect_clone_repository().returning(|_, _| {
            Err(TransportError::Git {
                operation: "clone",
                detail: "repository not found".to_string(),
            })
        });

        let outcome = engine(store.clone(), transport).sync(&descriptor(1, "a")).await;

        assert!(outcome.is_failure());
        assert_eq!(
            outcome.error_detail.as_deref(),
            Some("git clone failed: repository not found")
        );
        assert!(store.lookup(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure_and_marks_existing_record() {
        let store = store();
        let mut repo = descriptor(1, "a");

        let mut first = MockGitTransport::new();
        first.expect_is_repository().return_const(false);
        first.expect_clone_repository().returning(|_, _| Ok(()));
        engine(store.clone(), first).sync(&repo).await;

        repo.pushed_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());

        let mut second = MockGitTransport::new();
        second.expect_is_repository().return_const(true);
        second.expect_update_repository().returning(|_, _| {
            Err(TransportError::Timeout {
                operation: "fetch",
                timeout: Duration::from_secs(600),
            })
        });

        let outcome = engine(store.clone(), second).sync(&repo).await;

        assert!(outcome.is_failure());
        let record = store.lookup(1).unwrap().unwrap();
        assert_eq!(record.last_sync_status, SyncStatus::Failed);
        assert_eq!(
            record.last_error.as_deref(),
            Some("git fetch timed out after 600s")
        );
    }

    #[tokio::test]
    async fn test_failed_record_is_retried_even_when_unchanged() {
        let store = store();
        let repo = descriptor(1, "a");

        let mut first = MockGitTransport::new();
        first.expect_is_repository().return_const(false);
        first.expect_clone_repository().returning(|_, _| Ok(()));
        engine(store.clone(), first).sync(&repo).await;

        let mut failing = MockGitTransport::new();
        failing.expect_is_repository().return_const(true);
        failing.expect_update_repository().returning(|_, _| {
            Err(TransportError::Git {
                operation: "fetch",
                detail: "connection reset".to_string(),
            })
        });
        engine(store.clone(), failing)
            .with_skip_unchanged(false)
            .sync(&repo)
            .await;

        let mut retry = MockGitTransport::new();
        retry.expect_is_repository().return_const(true);
        retry.expect_update_repository().times(1).returning(|_, _| Ok(()));

        let outcome = engine(store, retry).sync(&repo).await;
        assert_eq!(outcome.action, SyncAction::Updated);
    }

    #[test]
    fn test_remote_for_protocols() {
        let repo = descriptor(1, "a");
        let transport = MockGitTransport::new();
        let https = engine(store(), transport).with_token("ghp_secret");

        let remote = https.remote_for(&repo);
        assert_eq!(remote.url, "https://github.com/octocat/a.git");
        assert!(remote.fetch_url.contains("x-access-token:ghp_secret@"));
        assert_eq!(remote.default_branch.as_deref(), Some("main"));

        let ssh = https.clone().with_protocol(CloneProtocol::Ssh);
        let remote = ssh.remote_for(&repo);
        assert_eq!(remote.url, "git@github.com:octocat/a.git");
        assert_eq!(remote.fetch_url, remote.url);
    }

    #[test]
    fn test_describe_includes_source_chain() {
        let error = TransportError::disk(
            "/backup/a.git",
            std::io::Error::new(std::io::ErrorKind::Other, "No space left on device"),
        );
        let detail = describe(&error);
        assert!(detail.contains("/backup/a.git"));
        assert_eq!(detail.matches("No space left on device").count(), 1);
    }
}
