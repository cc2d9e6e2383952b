//! Job records tracking each watched file through compression.
//!
//! A [`JobRecord`] is a transient, in-memory copy of a row in the job table.
//! The helper methods only change the copy; nothing is persisted until the
//! copy is handed to [`JobStore::update_conditional`](crate::store::JobStore::update_conditional),
//! which accepts it only if `version` still matches the stored row.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by the scheduler.
    #[default]
    Pending,
    /// Claimed by a worker; the transcoder is running.
    Compressing,
    /// Compressed output written.
    Done,
    /// Transcoder failed; see `error_message`.
    Failed,
}

impl JobStatus {
    /// Integer stored in the `status` column.
    pub fn code(self) -> i64 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Compressing => 1,
            JobStatus::Done => 2,
            JobStatus::Failed => 3,
        }
    }

    /// Inverse of [`JobStatus::code`].
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(JobStatus::Pending),
            1 => Some(JobStatus::Compressing),
            2 => Some(JobStatus::Done),
            3 => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Staying in the same status is always allowed (e.g. a Pending row picking
    /// up a newer hash). `Compressing -> Pending` is the release path used by
    /// stale-claim recovery and by the scheduler when the transcoder vanished.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Compressing)
                | (Compressing, Done)
                | (Compressing, Failed)
                | (Compressing, Pending)
                | (Done, Pending)
                | (Failed, Pending)
                | (Done, Done)
                | (Failed, Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Compressing => write!(f, "compressing"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted state for one watched file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    /// Surrogate key assigned by the store on insert. Zero before insert.
    pub id: i64,
    /// Absolute path of the source file. Unique across all records.
    pub file_path: PathBuf,
    /// Hex SHA-256 of the file bytes at the last scan.
    pub content_hash: String,
    pub status: JobStatus,
    /// Compressed output; kept when the row goes back to Pending.
    pub output_path: Option<PathBuf>,
    /// Transcoder diagnostics; only present while Failed.
    pub error_message: Option<String>,
    /// Unix timestamp (milliseconds) of the last successful encode.
    pub compressed_at: Option<i64>,
    /// Unix timestamp (milliseconds) of the last mutation, set by the store.
    pub last_modified: i64,
    /// Optimistic-concurrency token. Starts at 1, +1 per stored mutation.
    pub version: i64,
}

impl JobRecord {
    /// A fresh Pending record for a newly observed file.
    pub fn new_pending(file_path: impl Into<PathBuf>, content_hash: impl Into<String>) -> Self {
        Self {
            id: 0,
            file_path: file_path.into(),
            content_hash: content_hash.into(),
            status: JobStatus::Pending,
            output_path: None,
            error_message: None,
            compressed_at: None,
            last_modified: current_timestamp_ms(),
            version: 1,
        }
    }

    /// Copy moved to Compressing, ready to be submitted as a claim.
    pub fn claimed(&self) -> Self {
        let mut next = self.clone();
        next.status = JobStatus::Compressing;
        next.error_message = None;
        next
    }

    /// Copy moved to Done with the written output.
    pub fn completed(&self, output_path: impl Into<PathBuf>) -> Self {
        let mut next = self.clone();
        next.status = JobStatus::Done;
        next.output_path = Some(output_path.into());
        next.error_message = None;
        next.compressed_at = Some(current_timestamp_ms());
        next
    }

    /// Copy moved to Failed with the transcoder's diagnostics.
    pub fn failed(&self, reason: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.status = JobStatus::Failed;
        next.error_message = Some(reason.into());
        next
    }

    /// Copy moved back to Pending after the file content changed.
    ///
    /// `output_path` is left alone so the previous output stays referenced
    /// until the next successful encode replaces it.
    pub fn rehashed(&self, content_hash: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.content_hash = content_hash.into();
        next.status = JobStatus::Pending;
        next.error_message = None;
        next
    }

    /// Copy handed back to the queue without any other change.
    pub fn released(&self) -> Self {
        let mut next = self.clone();
        next.status = JobStatus::Pending;
        next
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
