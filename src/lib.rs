//! github-export - Resumable backup of every repository in a GitHub account
//!
//! A run lists the account's repositories through the GitHub REST API and
//! mirrors each one to a deterministic local path: new repositories are
//! cloned, existing mirrors are updated, and mirrors whose remote has not
//! changed since the last run are skipped. An on-disk index remembers every
//! mirror, so an interrupted export can simply be run again.
//!
//! ## Modules
//!
//! - [`config`]: YAML configuration, defaults and validation
//! - [`github`]: repository listing, filtering and authentication
//! - [`git`]: clone and update through the system `git` binary
//! - [`store`]: SQLite index of local mirrors and run history
//! - [`sync`]: per-repository clone / update / skip decisions
//! - [`export`]: bounded worker pool driving a whole run
//! - [`health`]: preflight checks for the `doctor` command

pub mod config;
pub mod error;
pub mod export;
pub mod git;
pub mod github;
pub mod health;
pub mod retry;
pub mod store;
pub mod sync;

pub use config::Config;
pub use error::{ExportError, TransportError};
pub use export::{ExportReport, Exporter, PlannedSync};
pub use git::{GitCli, GitTransport, Remote};
pub use github::{GitHubClient, RepositoryDescriptor, RepositoryFilter, RepositorySource};
pub use health::HealthCheck;
pub use store::{MirrorRecord, MirrorStore, SyncStatus};
pub use sync::{PlannedAction, SyncAction, SyncEngine, SyncOutcome};
