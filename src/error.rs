//! Error taxonomy for an export run.
//!
//! Two families exist and they never mix:
//!
//! - [`ExportError`] is fatal. It aborts [`Exporter::run`](crate::Exporter::run)
//!   and surfaces to the caller (rejected credentials, exhausted rate limit,
//!   a listing call that failed outright, a broken index).
//! - [`TransportError`] is scoped to one repository. The sync engine converts it
//!   into a `failed` outcome and the run moves on to the next repository.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("GitHub rejected the credentials: {0}")]
    Auth(String),

    #[error("GitHub API rate limit still exceeded after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("Repository listing failed: {0}")]
    ListingFailed(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Mirror index error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single clone or update.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("git {operation} failed: {detail}")]
    Git {
        operation: &'static str,
        detail: String,
    },

    #[error("git {operation} timed out after {}s", .timeout.as_secs())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("disk error at {}: {source}", .path.display())]
    Disk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run git: {0}")]
    Spawn(#[source] std::io::Error),
}

impl TransportError {
    pub fn disk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Disk {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_error_messages() {
        let err = ExportError::RateLimited { attempts: 5 };
        assert!(err.to_string().contains("5 attempts"));

        let err = ExportError::Auth("Bad credentials".to_string());
        assert!(err.to_string().contains("Bad credentials"));
    }

    #[test]
    fn test_transport_error_messages() {
        let err = TransportError::Timeout {
            operation: "clone",
            timeout: Duration::from_secs(600),
        };
        assert_eq!(err.to_string(), "git clone timed out after 600s");

        let err = TransportError::disk(
            "/backup/a.git",
            std::io::Error::new(std::io::ErrorKind::Other, "No space left on device"),
        );
        assert!(err.to_string().contains("/backup/a.git"));
        assert!(err.to_string().contains("No space left"));
    }
}
