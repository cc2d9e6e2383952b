//! Metrics module for compressd
//!
//! Counters for the ingest monitor and the compression scheduler, the jobs
//! currently running, and job-table totals, all serializable as one JSON
//! snapshot.

use crate::jobs::current_timestamp_ms;
use crate::store::StatusCounts;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// An encode currently in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunningJob {
    pub id: i64,
    pub input_path: String,
    pub output_path: String,
    pub encoder: String,
    pub started_at_unix_ms: i64,
    pub size_in_bytes_before: u64,
}

/// Outcomes of filesystem reconciliation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IngestCounters {
    /// New rows inserted as Pending.
    pub inserted: u64,
    /// Existing rows flipped back to Pending after a content change.
    pub marked_pending: u64,
    /// Rows deleted because the source file is gone.
    pub removed: u64,
    /// Mutations that lost a version race.
    pub conflicts: u64,
    /// Events abandoned after retries ran out.
    pub dropped_events: u64,
}

/// Outcomes of the poll loop and its workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchedulerCounters {
    pub cycles: u64,
    /// Cycles skipped because the transcoder could not be found.
    pub skipped_cycles: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Claims handed back to Pending.
    pub released: u64,
    pub cancelled: u64,
    /// Terminal updates discarded after losing a race.
    pub discarded: u64,
    /// Claim attempts that lost a race.
    pub conflicts: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub running: Vec<RunningJob>,
    pub ingest: IngestCounters,
    pub scheduler: SchedulerCounters,
    /// Job-table totals as of the last poll cycle.
    pub table: StatusCounts,
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

impl MetricsSnapshot {
    pub fn touch(&mut self) {
        self.timestamp_unix_ms = current_timestamp_ms();
    }

    pub fn remove_running(&mut self, id: i64) {
        self.running.retain(|j| j.id != id);
    }
}

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}
