//! Durable job table on SQLite.
//!
//! Every mutation is a single-row statement guarded by the row's `version`
//! column (`... WHERE id = ? AND version = ?`). A write against a stale
//! version touches nothing and reports [`StoreError::VersionConflict`], which
//! is how the monitor and the scheduler stay out of each other's way without
//! sharing a lock.

use crate::jobs::{current_timestamp_ms, JobRecord, JobStatus};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Params, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::time::Duration;
use thiserror::Error;

/// Type alias for the database connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

const POOL_SIZE: u32 = 8;
const BUSY_TIMEOUT_MS: u32 = 5_000;

const COLS: &str = "id, file_path, content_hash, status, output_path, error_message,
    compressed_at, last_modified, version";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS video_files (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path     TEXT    NOT NULL UNIQUE,
    content_hash  TEXT    NOT NULL,
    status        INTEGER NOT NULL DEFAULT 0,
    output_path   TEXT,
    error_message TEXT,
    compressed_at INTEGER,
    last_modified INTEGER NOT NULL,
    version       INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_video_files_status ON video_files(status);
";

/// Errors from job store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("a job for {0} already exists")]
    DuplicatePath(PathBuf),

    #[error("job {id} changed underneath us (expected version {expected})")]
    VersionConflict { id: i64, expected: i64 },

    #[error("job {0} not found")]
    NotFound(i64),

    #[error("job {id}: status cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Pool(_) => true,
            StoreError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Job-table counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub compressing: u64,
    pub done: u64,
    pub failed: u64,
}

/// Handle to the job table. Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct JobStore {
    pool: DbPool,
}

impl JobStore {
    /// Open (creating if needed) the database file at `db_path`.
    ///
    /// Connections run in WAL mode with a busy timeout so concurrent writers
    /// queue on the write lock instead of failing outright.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(&format!(
                "PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};
                 PRAGMA journal_mode = WAL;"
            ))
        });

        let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;
        Self::from_pool(pool)
    }

    /// Open a private in-memory database.
    ///
    /// The pool holds a single long-lived connection: a shared-cache memory
    /// database disappears once its last connection closes.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let uri = format!("file:compressd_mem_{n}?mode=memory&cache=shared");

        let manager = SqliteConnectionManager::file(uri);
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: DbPool) -> Result<Self, StoreError> {
        pool.get()?.execute_batch(SCHEMA)?;
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.pool.get()?)
    }

    /// Insert a new record and return its id.
    ///
    /// The stored row always starts at version 1 with a fresh
    /// `last_modified`, whatever the passed record carries.
    pub fn insert(&self, record: &JobRecord) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO video_files (file_path, content_hash, status, output_path,
                 error_message, compressed_at, last_modified, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
            params![
                path_text(&record.file_path),
                record.content_hash,
                record.status.code(),
                record.output_path.as_deref().map(path_text),
                record.error_message,
                record.compressed_at,
                current_timestamp_ms(),
            ],
        );

        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Err(StoreError::DuplicatePath(record.file_path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn find_by_path(&self, path: &Path) -> Result<Option<JobRecord>, StoreError> {
        let conn = self.conn()?;
        let q = format!("SELECT {COLS} FROM video_files WHERE file_path = ?1");
        Ok(conn
            .query_row(&q, [path_text(path)], record_from_row)
            .optional()?)
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<JobRecord>, StoreError> {
        let conn = self.conn()?;
        find_by_id(&conn, id)
    }

    /// Write `record` back if the stored row is still at `record.version`.
    ///
    /// On success the row's version is incremented by one, `last_modified` is
    /// refreshed, and the stored record is returned. `file_path` and `id` are
    /// never rewritten.
    pub fn update_conditional(&self, record: &JobRecord) -> Result<JobRecord, StoreError> {
        let conn = self.conn()?;
        let allowed = allowed_sources(record.status);
        let q = format!(
            "UPDATE video_files
             SET content_hash = ?1, status = ?2, output_path = ?3, error_message = ?4,
                 compressed_at = ?5, last_modified = ?6, version = version + 1
             WHERE id = ?7 AND version = ?8 AND status IN ({allowed})
             RETURNING {COLS}"
        );

        let updated = conn
            .query_row(
                &q,
                params![
                    record.content_hash,
                    record.status.code(),
                    record.output_path.as_deref().map(path_text),
                    record.error_message,
                    record.compressed_at,
                    current_timestamp_ms(),
                    record.id,
                    record.version,
                ],
                record_from_row,
            )
            .optional()?;

        match updated {
            Some(stored) => Ok(stored),
            None => Err(explain_miss(&conn, record.id, record.version, record.status)),
        }
    }

    /// Delete the row if it is still at `version`.
    pub fn delete_conditional(&self, id: i64, version: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM video_files WHERE id = ?1 AND version = ?2",
            params![id, version],
        )?;
        if n == 1 {
            return Ok(());
        }
        match find_by_id(&conn, id)? {
            Some(_) => Err(StoreError::VersionConflict {
                id,
                expected: version,
            }),
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// All Pending rows, oldest first.
    pub fn list_pending(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.query_list(&format!(
            "SELECT {COLS} FROM video_files WHERE status = {} ORDER BY id",
            JobStatus::Pending.code()
        ))
    }

    pub fn list_all(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.query_list(&format!("SELECT {COLS} FROM video_files ORDER BY id"))
    }

    /// Records whose path lies at or beneath `dir`.
    ///
    /// LIKE folds ASCII case, so the prefix is compared again exactly.
    pub fn list_under(&self, dir: &Path) -> Result<Vec<JobRecord>, StoreError> {
        let dir = path_text(dir);
        let mut prefix = dir.clone();
        if !prefix.ends_with(MAIN_SEPARATOR) {
            prefix.push(MAIN_SEPARATOR);
        }
        let pattern = format!("{}%", escape_like(&prefix));
        self.query_list_with(
            &format!(
                "SELECT {COLS} FROM video_files
                 WHERE file_path = ?1
                    OR (file_path LIKE ?2 ESCAPE '\\' AND substr(file_path, 1, length(?3)) = ?3)
                 ORDER BY id"
            ),
            params![dir, pattern, prefix],
        )
    }

    fn query_list(&self, q: &str) -> Result<Vec<JobRecord>, StoreError> {
        self.query_list_with(q, [])
    }

    fn query_list_with(&self, q: &str, args: impl Params) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(q)?;
        let rows = stmt
            .query_map(args, record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM video_files GROUP BY status")?;
        let mut counts = StatusCounts::default();
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (code, n) = row?;
            let n = n.max(0) as u64;
            match JobStatus::from_code(code) {
                Some(JobStatus::Pending) => counts.pending = n,
                Some(JobStatus::Compressing) => counts.compressing = n,
                Some(JobStatus::Done) => counts.done = n,
                Some(JobStatus::Failed) => counts.failed = n,
                None => {}
            }
        }
        Ok(counts)
    }

    /// Move Compressing rows untouched for longer than `older_than` back to
    /// Pending. Returns the number of rows reset.
    pub fn reset_stale_claims(&self, older_than: Duration) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let now = current_timestamp_ms();
        let cutoff = now - older_than.as_millis() as i64;
        let n = conn.execute(
            "UPDATE video_files
             SET status = ?1, last_modified = ?2, version = version + 1
             WHERE status = ?3 AND last_modified < ?4",
            params![
                JobStatus::Pending.code(),
                now,
                JobStatus::Compressing.code(),
                cutoff
            ],
        )?;
        Ok(n)
    }
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn find_by_id(conn: &Connection, id: i64) -> Result<Option<JobRecord>, StoreError> {
    let q = format!("SELECT {COLS} FROM video_files WHERE id = ?1");
    Ok(conn.query_row(&q, [id], record_from_row).optional()?)
}

/// Work out why a guarded update matched no row.
fn explain_miss(conn: &Connection, id: i64, expected: i64, to: JobStatus) -> StoreError {
    match find_by_id(conn, id) {
        Ok(None) => StoreError::NotFound(id),
        Ok(Some(current)) if current.version != expected => {
            StoreError::VersionConflict { id, expected }
        }
        Ok(Some(current)) => StoreError::InvalidTransition {
            id,
            from: current.status,
            to,
        },
        Err(e) => e,
    }
}

/// SQL list of status codes that may move to `to`.
fn allowed_sources(to: JobStatus) -> String {
    [
        JobStatus::Pending,
        JobStatus::Compressing,
        JobStatus::Done,
        JobStatus::Failed,
    ]
    .into_iter()
    .filter(|from| from.can_transition_to(to))
    .map(|s| s.code().to_string())
    .collect::<Vec<_>>()
    .join(", ")
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let code: i64 = row.get(3)?;
    let status =
        JobStatus::from_code(code).ok_or(rusqlite::Error::IntegralValueOutOfRange(3, code))?;
    Ok(JobRecord {
        id: row.get(0)?,
        file_path: PathBuf::from(row.get::<_, String>(1)?),
        content_hash: row.get(2)?,
        status,
        output_path: row.get::<_, Option<String>>(4)?.map(PathBuf::from),
        error_message: row.get(5)?,
        compressed_at: row.get(6)?,
        last_modified: row.get(7)?,
        version: row.get(8)?,
    })
}
