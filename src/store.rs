//! Mirror Store - SQLite index of exported repositories
//!
//! This module owns the on-disk index that makes exports resumable:
//! - One record per remote repository id (local path, last sync time and status)
//! - A history of completed export runs
//! - The mapping from repository names to deterministic local paths
//!
//! Every write runs in its own transaction. A crash mid-run loses at most the
//! update that was in flight; everything committed before it stays readable.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::config::MirrorMode;
use crate::error::ExportError;
use crate::export::ExportReport;
use crate::github::RepositoryDescriptor;
use crate::sync::{SyncAction, SyncOutcome};

/// Status of the last sync attempt recorded for a mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Cloned,
    Updated,
    Skipped,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Cloned => "cloned",
            SyncStatus::Updated => "updated",
            SyncStatus::Skipped => "skipped",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cloned" => Some(SyncStatus::Cloned),
            "updated" => Some(SyncStatus::Updated),
            "skipped" => Some(SyncStatus::Skipped),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }

    /// Whether the mirror was left in a consistent, current state
    pub fn is_success(&self) -> bool {
        !matches!(self, SyncStatus::Failed)
    }
}

impl From<SyncAction> for SyncStatus {
    fn from(action: SyncAction) -> Self {
        match action {
            SyncAction::Cloned => SyncStatus::Cloned,
            SyncAction::Updated => SyncStatus::Updated,
            SyncAction::Skipped => SyncStatus::Skipped,
            SyncAction::Failed => SyncStatus::Failed,
        }
    }
}

/// Index entry for one local mirror
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorRecord {
    pub descriptor_id: i64,
    pub full_name: String,
    pub local_path: PathBuf,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_sync_status: SyncStatus,
    /// Remote activity timestamp observed at the last successful sync
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// One row of the run history
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub cloned: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub not_attempted: usize,
    pub interrupted: bool,
}

/// Paths handed out during this process, keyed both ways
#[derive(Debug, Default)]
struct PathClaims {
    by_id: HashMap<i64, PathBuf>,
    by_path: HashMap<PathBuf, i64>,
}

impl PathClaims {
    fn claim(&mut self, id: i64, relative: PathBuf) {
        self.by_path.insert(relative.clone(), id);
        self.by_id.insert(id, relative);
    }

    fn is_taken(&self, relative: &Path) -> bool {
        self.by_path.contains_key(relative)
    }
}

/// Owned handle to the mirror index.
///
/// Shared between workers as `Arc<MirrorStore>`; the connection mutex makes
/// it the single writer.
pub struct MirrorStore {
    conn: Mutex<Connection>,
    root: PathBuf,
    mode: MirrorMode,
    claims: Mutex<PathClaims>,
}

impl MirrorStore {
    /// Open or create the index at `index_path` for mirrors under `root`
    pub fn open(index_path: &Path, root: impl Into<PathBuf>, mode: MirrorMode) -> Result<Self, ExportError> {
        if let Some(parent) = index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(index_path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

        let store = Self::with_connection(conn, root.into(), mode)?;
        info!("Mirror index opened at {}", index_path.display());
        Ok(store)
    }

    /// Open an in-memory index (for testing and dry runs without an index)
    pub fn open_in_memory(root: impl Into<PathBuf>, mode: MirrorMode) -> Result<Self, ExportError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, root.into(), mode)
    }

    fn with_connection(conn: Connection, root: PathBuf, mode: MirrorMode) -> Result<Self, ExportError> {
        initialize(&conn)?;

        let mut claims = PathClaims::default();
        {
            let mut stmt = conn.prepare("SELECT descriptor_id, local_path FROM mirrors")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
            for row in rows {
                let (id, path) = row?;
                claims.claim(id, PathBuf::from(path));
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            root,
            mode,
            claims: Mutex::new(claims),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claims(&self) -> MutexGuard<'_, PathClaims> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // =========================================================================
    // Path assignment
    // =========================================================================

    /// Local path of the mirror for `descriptor`.
    ///
    /// A path recorded in the index always wins. Otherwise the normalized name
    /// is used, with `-<id>` appended when another repository already holds it.
    /// Repeated calls for the same id return the same path.
    pub fn path_for(&self, descriptor: &RepositoryDescriptor) -> PathBuf {
        let mut claims = self.claims();
        let relative = self.claim_path(&mut claims, descriptor);
        self.root.join(relative)
    }

    /// Claim paths for a whole listing before any work starts.
    ///
    /// When new repositories collide with each other, the lowest id keeps the
    /// plain name, so the outcome does not depend on worker scheduling.
    pub fn assign_paths(&self, descriptors: &[RepositoryDescriptor]) {
        let mut ordered: Vec<&RepositoryDescriptor> = descriptors.iter().collect();
        ordered.sort_by_key(|d| d.id);

        let mut claims = self.claims();
        for descriptor in ordered {
            self.claim_path(&mut claims, descriptor);
        }
    }

    fn claim_path(&self, claims: &mut PathClaims, descriptor: &RepositoryDescriptor) -> PathBuf {
        if let Some(existing) = claims.by_id.get(&descriptor.id) {
            return existing.clone();
        }

        let base = normalize_name(&descriptor.name);
        let mut relative = self.layout_name(&base);
        if claims.is_taken(&relative) {
            relative = self.layout_name(&format!("{}-{}", base, descriptor.id));
            let mut n = 2;
            while claims.is_taken(&relative) {
                relative = self.layout_name(&format!("{}-{}-{}", base, descriptor.id, n));
                n += 1;
            }
            debug!(
                "Name collision for {}, using {}",
                descriptor.full_name,
                relative.display()
            );
        }

        claims.claim(descriptor.id, relative.clone());
        relative
    }

    fn layout_name(&self, base: &str) -> PathBuf {
        match self.mode {
            MirrorMode::Mirror => PathBuf::from(format!("{}.git", base)),
            MirrorMode::WorkingTree => PathBuf::from(base),
        }
    }

    // =========================================================================
    // Mirror records
    // =========================================================================

    /// Record for a repository id, if it was ever exported
    pub fn lookup(&self, descriptor_id: i64) -> Result<Option<MirrorRecord>, ExportError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("{} WHERE descriptor_id = ?1", SELECT_MIRROR),
                params![descriptor_id],
                |row| self.mirror_from_row(row),
            )
            .optional()?;
        Ok(record)
    }

    /// Persist the outcome of one sync attempt.
    ///
    /// A successful clone or update creates or replaces the record. A skip or
    /// a failure only touches an existing record: a repository that never
    /// cloned successfully has no record.
    pub fn record(&self, descriptor: &RepositoryDescriptor, outcome: &SyncOutcome) -> Result<(), ExportError> {
        let now = Utc::now().to_rfc3339();
        let status = SyncStatus::from(outcome.action);
        let relative = self.relative_path(&outcome.local_path);

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        match outcome.action {
            SyncAction::Cloned | SyncAction::Updated => {
                tx.execute(
                    r#"
                    INSERT INTO mirrors (descriptor_id, full_name, local_path, last_synced_at, last_sync_status, remote_updated_at, last_error, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?4)
                    ON CONFLICT(descriptor_id) DO UPDATE SET
                        full_name = ?2,
                        local_path = ?3,
                        last_synced_at = ?4,
                        last_sync_status = ?5,
                        remote_updated_at = ?6,
                        last_error = NULL,
                        updated_at = ?4
                    "#,
                    params![
                        descriptor.id,
                        descriptor.full_name,
                        relative,
                        now,
                        status.as_str(),
                        descriptor.last_activity().to_rfc3339(),
                    ],
                )?;
            }
            SyncAction::Skipped => {
                tx.execute(
                    "UPDATE mirrors SET last_sync_status = ?2, last_error = NULL, updated_at = ?3 WHERE descriptor_id = ?1",
                    params![descriptor.id, status.as_str(), now],
                )?;
            }
            SyncAction::Failed => {
                tx.execute(
                    "UPDATE mirrors SET last_sync_status = ?2, last_error = ?3, updated_at = ?4 WHERE descriptor_id = ?1",
                    params![descriptor.id, status.as_str(), outcome.error_detail, now],
                )?;
            }
        }

        tx.commit()?;
        debug!("Recorded {} -> {}", descriptor.full_name, status.as_str());
        Ok(())
    }

    /// All records, ordered by repository name
    pub fn records(&self) -> Result<Vec<MirrorRecord>, ExportError> {
        self.query_mirrors(&format!("{} ORDER BY full_name", SELECT_MIRROR), &[])
    }

    /// Records whose last sync attempt failed
    pub fn failed_records(&self) -> Result<Vec<MirrorRecord>, ExportError> {
        self.query_mirrors(
            &format!("{} WHERE last_sync_status = ?1 ORDER BY full_name", SELECT_MIRROR),
            &[&SyncStatus::Failed.as_str()],
        )
    }

    fn query_mirrors(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<MirrorRecord>, ExportError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let records = stmt
            .query_map(args, |row| self.mirror_from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn mirror_from_row(&self, row: &Row<'_>) -> rusqlite::Result<MirrorRecord> {
        Ok(MirrorRecord {
            descriptor_id: row.get(0)?,
            full_name: row.get(1)?,
            local_path: self.root.join(row.get::<_, String>(2)?),
            last_synced_at: parse_timestamp(row.get(3)?),
            last_sync_status: SyncStatus::parse(&row.get::<_, String>(4)?).unwrap_or(SyncStatus::Failed),
            remote_updated_at: parse_timestamp(row.get(5)?),
            last_error: row.get(6)?,
        })
    }

    fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    // =========================================================================
    // Run history
    // =========================================================================

    /// Append a finished run to the history
    pub fn record_run(&self, report: &ExportReport) -> Result<i64, ExportError> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO runs (started_at, finished_at, total, cloned, updated, skipped, failed, not_attempted, interrupted)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                report.started_at.to_rfc3339(),
                report.finished_at().to_rfc3339(),
                report.total as i64,
                report.cloned as i64,
                report.updated as i64,
                report.skipped as i64,
                report.failed as i64,
                report.not_attempted as i64,
                report.interrupted,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent runs first
    pub fn recent_runs(&self, limit: u32) -> Result<Vec<RunSummary>, ExportError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, started_at, finished_at, total, cloned, updated, skipped, failed, not_attempted, interrupted
            FROM runs
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let runs = stmt
            .query_map(params![limit], |row| {
                Ok(RunSummary {
                    id: row.get(0)?,
                    started_at: parse_timestamp(row.get(1)?).unwrap_or_else(Utc::now),
                    finished_at: parse_timestamp(row.get(2)?).unwrap_or_else(Utc::now),
                    total: row.get::<_, i64>(3)? as usize,
                    cloned: row.get::<_, i64>(4)? as usize,
                    updated: row.get::<_, i64>(5)? as usize,
                    skipped: row.get::<_, i64>(6)? as usize,
                    failed: row.get::<_, i64>(7)? as usize,
                    not_attempted: row.get::<_, i64>(8)? as usize,
                    interrupted: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(runs)
    }
}

const SELECT_MIRROR: &str = r#"
    SELECT descriptor_id, full_name, local_path, last_synced_at, last_sync_status, remote_updated_at, last_error
    FROM mirrors
"#;

fn initialize(conn: &Connection) -> Result<(), ExportError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS mirrors (
            descriptor_id INTEGER PRIMARY KEY,
            full_name TEXT NOT NULL,
            local_path TEXT NOT NULL UNIQUE,
            last_synced_at TEXT,
            last_sync_status TEXT NOT NULL,
            remote_updated_at TEXT,
            last_error TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            total INTEGER NOT NULL,
            cloned INTEGER NOT NULL,
            updated INTEGER NOT NULL,
            skipped INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            not_attempted INTEGER NOT NULL,
            interrupted INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_mirrors_status ON mirrors(last_sync_status);
        "#,
    )?;

    debug!("Index schema initialized");
    Ok(())
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Filesystem-safe directory name for a repository name.
///
/// Lowercased so that names differing only in case collide on every
/// filesystem; anything outside `[a-z0-9._-]` becomes `-`.
pub fn normalize_name(name: &str) -> String {
    let mapped: String = name
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();

    let trimmed = mapped.trim_start_matches('.');
    if trimmed.is_empty() {
        "repository".to_string()
    } else {
        trimmed.to_string()
    }
}
