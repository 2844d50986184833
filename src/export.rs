//! Export Orchestrator - Runs a complete export of an account
//!
//! Lists every repository through the [`RepositorySource`], applies the
//! configured filters, then syncs the repositories through a bounded worker
//! pool and aggregates the outcomes into an [`ExportReport`].

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CloneProtocol, Config};
use crate::error::ExportError;
use crate::git::GitCli;
use crate::github::{GitHubClient, RepositoryDescriptor, RepositoryFilter, RepositorySource};
use crate::store::MirrorStore;
use crate::sync::{PlannedAction, SyncAction, SyncEngine, SyncOutcome};

/// Summary of one export run
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub total: usize,
    pub cloned: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Repositories never dispatched because the run was cancelled
    pub not_attempted: usize,
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// One outcome per attempted repository, in listing order
    pub outcomes: Vec<SyncOutcome>,
}

impl ExportReport {
    pub fn new(
        total: usize,
        outcomes: Vec<SyncOutcome>,
        not_attempted: usize,
        interrupted: bool,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let count = |action: SyncAction| outcomes.iter().filter(|o| o.action == action).count();

        Self {
            total,
            cloned: count(SyncAction::Cloned),
            updated: count(SyncAction::Updated),
            skipped: count(SyncAction::Skipped),
            failed: count(SyncAction::Failed),
            not_attempted,
            interrupted,
            started_at,
            duration,
            outcomes,
        }
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.duration).unwrap_or_else(|_| chrono::Duration::zero());
        self.started_at + elapsed
    }

    /// No failures and the run was not cut short
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.interrupted
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Failed outcomes, each with its error detail
    pub fn failures(&self) -> impl Iterator<Item = &SyncOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }
}

/// What a run would do for one repository
#[derive(Debug, Clone)]
pub struct PlannedSync {
    pub descriptor: RepositoryDescriptor,
    pub action: PlannedAction,
    pub local_path: PathBuf,
}

/// Drives the lister and the sync engine for a whole account
pub struct Exporter {
    source: Arc<dyn RepositorySource>,
    engine: SyncEngine,
    filter: RepositoryFilter,
    concurrency: usize,
    cancel: CancellationToken,
}

impl Exporter {
    pub fn new(source: Arc<dyn RepositorySource>, engine: SyncEngine) -> Self {
        Self {
            source,
            engine,
            filter: RepositoryFilter::accept_all(),
            concurrency: 4,
            cancel: CancellationToken::new(),
        }
    }

    /// Wire up the GitHub client, git CLI transport and on-disk index from `config`
    pub fn from_config(config: &Config, token: String) -> Result<Self, ExportError> {
        let store = MirrorStore::open(&config.index_file(), config.base_path(), config.sync.mode)?;
        Self::with_store(config, token, store)
    }

    /// Like [`Exporter::from_config`], for [`Exporter::plan`]: a missing index is
    /// stood in for by an empty in-memory one instead of being created on disk
    pub fn for_plan(config: &Config, token: String) -> Result<Self, ExportError> {
        let index = config.index_file();
        let store = if index.exists() {
            MirrorStore::open(&index, config.base_path(), config.sync.mode)?
        } else {
            debug!("No index at {}, planning against an empty one", index.display());
            MirrorStore::open_in_memory(config.base_path(), config.sync.mode)?
        };
        Self::with_store(config, token, store)
    }

    fn with_store(config: &Config, token: String, store: MirrorStore) -> Result<Self, ExportError> {
        let store = Arc::new(store);
        let source = Arc::new(GitHubClient::new(config, token.clone())?);
        let transport = Arc::new(GitCli::from_config(config));

        let git_token = match config.sync.protocol {
            CloneProtocol::Https => Some(token),
            CloneProtocol::Ssh => None,
        };
        let engine = SyncEngine::from_config(config, store, transport, git_token);

        Ok(Self::new(source, engine)
            .with_filter(RepositoryFilter::from_config(config)?)
            .with_concurrency(config.sync.concurrency))
    }

    pub fn with_filter(mut self, filter: RepositoryFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_skip_unchanged(mut self, skip_unchanged: bool) -> Self {
        self.engine = self.engine.with_skip_unchanged(skip_unchanged);
        self
    }

    /// Token that stops dispatching new repositories when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &Arc<MirrorStore> {
        self.engine.store()
    }

    /// List and filter the account's repositories, and claim their local paths
    pub async fn discover(&self) -> Result<Vec<RepositoryDescriptor>, ExportError> {
        debug!("Listing repositories from {}", self.source.provider_name());

        let listed = self.source.list_all().await?;
        let listed_count = listed.len();
        let repositories = self.filter.apply(listed);

        info!(
            "Discovered {} repositories ({} after filtering)",
            listed_count,
            repositories.len()
        );

        self.store().assign_paths(&repositories);
        Ok(repositories)
    }

    /// Dry run: what a run would do for every repository, without any git calls
    pub async fn plan(&self) -> Result<Vec<PlannedSync>, ExportError> {
        let repositories = self.discover().await?;

        repositories
            .into_iter()
            .map(|descriptor| {
                let (action, local_path) = self.engine.plan(&descriptor)?;
                Ok(PlannedSync {
                    descriptor,
                    action,
                    local_path,
                })
            })
            .collect()
    }

    /// Export every repository of the account.
    ///
    /// Only listing and index errors abort the run. Per-repository failures
    /// are reported in the returned [`ExportReport`].
    pub async fn run(&self) -> Result<ExportReport, ExportError> {
        let started_at = Utc::now();
        let start_time = Instant::now();

        info!("Starting export");

        let repositories = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                warn!("Export cancelled before listing completed");
                let report = ExportReport::new(0, Vec::new(), 0, true, started_at, start_time.elapsed());
                self.record_history(&report);
                return Ok(report);
            }
            listed = self.discover() => listed?,
        };

        let total = repositories.len();
        info!(
            "Syncing {} repositories with concurrency {}",
            total, self.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut futures = FuturesUnordered::new();

        for (index, descriptor) in repositories.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let engine = self.engine.clone();
            let cancel = self.cancel.clone();

            futures.push(async move {
                // Waiting for a worker slot is where cancellation stops dispatch
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return (index, None),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return (index, None),
                    },
                };

                (index, Some(engine.sync(&descriptor).await))
            });
        }

        let mut results: Vec<(usize, Option<SyncOutcome>)> = Vec::with_capacity(total);
        let mut completed = 0;

        while let Some((index, outcome)) = futures.next().await {
            if let Some(outcome) = &outcome {
                completed += 1;
                debug!(
                    "[{}/{}] {} -> {}",
                    completed, total, outcome.name, outcome.action
                );
            }
            results.push((index, outcome));
        }

        results.sort_by_key(|(index, _)| *index);
        let not_attempted = results.iter().filter(|(_, o)| o.is_none()).count();
        let outcomes: Vec<SyncOutcome> = results.into_iter().filter_map(|(_, o)| o).collect();
        let interrupted = self.cancel.is_cancelled();

        let report = ExportReport::new(
            total,
            outcomes,
            not_attempted,
            interrupted,
            started_at,
            start_time.elapsed(),
        );

        info!(
            "Export completed in {:.2}s: {} cloned, {} updated, {} skipped, {} failed",
            report.duration.as_secs_f64(),
            report.cloned,
            report.updated,
            report.skipped,
            report.failed
        );
        if interrupted {
            warn!("Export interrupted, {} repositories not attempted", not_attempted);
        }
        for failure in report.failures() {
            warn!(
                "{}: {}",
                failure.name,
                failure.error_detail.as_deref().unwrap_or("unknown error")
            );
        }

        self.record_history(&report);
        Ok(report)
    }

    fn record_history(&self, report: &ExportReport) {
        if let Err(e) = self.store().record_run(report) {
            warn!("Failed to record run history: {}", e);
        }
    }
}
