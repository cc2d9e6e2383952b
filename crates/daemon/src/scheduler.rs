//! Compression scheduler for compressd
//!
//! Polls the job table on a fixed interval, claims Pending rows with a
//! conditional update, and runs each claimed job through ffmpeg on a worker
//! pool bounded by a semaphore. Each cycle waits for its own jobs before the
//! loop sleeps again, so at the start of a cycle this scheduler owns no
//! Compressing row; any old enough is left over from a crash and is reset.

use crate::config::{Config, EncodeConfig};
use crate::concurrency::ConcurrencyPlan;
use crate::encode::{
    archive_existing_output, build_ffmpeg_args, output_path_for, resolve_executable,
    run_process, video_encoder_name, FfmpegEncodeParams, RunError,
};
use crate::jobs::{current_timestamp_ms, JobRecord};
use crate::metrics::{RunningJob, SharedMetrics};
use crate::settle::RetryPolicy;
use crate::store::{JobStore, StoreError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest stderr excerpt stored as a job's error message.
const ERROR_MESSAGE_BYTES: usize = 4096;

/// Everything the scheduler needs from configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub ffmpeg_path: PathBuf,
    pub output_dir: PathBuf,
    pub policy: EncodeConfig,
    pub poll_interval: Duration,
    pub max_concurrent_jobs: u32,
    /// Age after which a Compressing row nobody is working on is reset.
    pub stale_claim_after: Duration,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &Config, plan: &ConcurrencyPlan) -> Self {
        Self {
            ffmpeg_path: cfg.paths.ffmpeg_path.clone(),
            output_dir: cfg.paths.output_dir.clone(),
            policy: cfg.encode,
            poll_interval: Duration::from_secs(cfg.scheduler.poll_interval_secs),
            max_concurrent_jobs: plan.max_concurrent_jobs,
            stale_claim_after: Duration::from_secs(cfg.scheduler.stale_claim_secs),
        }
    }
}

/// How a claimed job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { output: PathBuf },
    Failed { reason: String },
    /// Handed back to Pending; the transcoder could not be found.
    Released,
    /// Killed by shutdown; the row stays Compressing until the stale-claim sweep.
    Cancelled,
    /// The terminal update lost its race (the row changed or was deleted).
    Discarded,
    /// The terminal update could not be written; recovered by the stale-claim sweep.
    Abandoned,
}

/// Tally of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// The transcoder was missing, nothing was claimed.
    pub skipped: bool,
    /// Stale Compressing rows put back to Pending.
    pub reset: usize,
    pub claimed: usize,
    /// Pending rows left for a later cycle because a running job writes the
    /// same output file.
    pub held_back: usize,
    pub completed: usize,
    pub failed: usize,
    pub released: usize,
    pub cancelled: usize,
    pub discarded: usize,
}

/// Drives Pending jobs through ffmpeg.
#[derive(Clone)]
pub struct CompressionScheduler {
    store: JobStore,
    settings: Arc<SchedulerSettings>,
    /// Semaphore for limiting concurrent jobs
    semaphore: Arc<Semaphore>,
    metrics: SharedMetrics,
    store_retry: RetryPolicy,
    /// Output files being written by running jobs.
    busy_outputs: Arc<Mutex<HashSet<PathBuf>>>,
}

/// Releases an output path from the busy set when its job ends.
struct OutputGuard {
    busy: Arc<Mutex<HashSet<PathBuf>>>,
    output: PathBuf,
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        busy.remove(&self.output);
    }
}

impl CompressionScheduler {
    pub fn new(store: JobStore, settings: SchedulerSettings, metrics: SharedMetrics) -> Self {
        let permits = settings.max_concurrent_jobs.max(1) as usize;
        Self {
            store,
            settings: Arc::new(settings),
            semaphore: Arc::new(Semaphore::new(permits)),
            metrics,
            store_retry: RetryPolicy::default(),
            busy_outputs: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Get the number of available permits (slots for concurrent jobs)
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Poll until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.settings.poll_interval.as_secs(),
            workers = self.settings.max_concurrent_jobs,
            encoder = video_encoder_name(self.settings.policy.codec, self.settings.policy.hw_accel),
            "compression scheduler started"
        );

        while !cancel.is_cancelled() {
            let summary = self.run_cycle(&cancel).await;
            if summary.claimed > 0 {
                info!(
                    claimed = summary.claimed,
                    completed = summary.completed,
                    failed = summary.failed,
                    "poll cycle finished"
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        info!("compression scheduler stopped");
    }

    /// One poll: claim what is Pending, run it, and wait for all of it.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleSummary {
        let mut summary = CycleSummary::default();
        self.metrics.write().await.scheduler.cycles += 1;

        match self.store.reset_stale_claims(self.settings.stale_claim_after) {
            Ok(0) => {}
            Ok(n) => {
                warn!(count = n, "reset stale claims to pending");
                summary.reset = n;
            }
            Err(e) => warn!(error = %e, "stale-claim sweep failed"),
        }

        if let Err(e) = resolve_executable(&self.settings.ffmpeg_path) {
            error!(error = %e, "transcoder unavailable, skipping cycle");
            self.metrics.write().await.scheduler.skipped_cycles += 1;
            summary.skipped = true;
            return summary;
        }

        let pending = match self.store.list_pending() {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "failed to list pending jobs");
                return summary;
            }
        };

        let mut jobs = JoinSet::new();
        for record in pending {
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            };

            let output = output_path_for(&self.settings.output_dir, &record.file_path);
            let Some(guard) = self.reserve_output(&output) else {
                debug!(id = record.id, output = %output.display(), "output busy, holding job back");
                summary.held_back += 1;
                continue;
            };

            let claimed = match self.store.update_conditional(&record.claimed()) {
                Ok(claimed) => claimed,
                Err(
                    StoreError::VersionConflict { .. }
                    | StoreError::NotFound(_)
                    | StoreError::InvalidTransition { .. },
                ) => {
                    debug!(id = record.id, "claim lost, skipping this cycle");
                    self.metrics.write().await.scheduler.conflicts += 1;
                    continue;
                }
                Err(e) => {
                    warn!(id = record.id, error = %e, "claim failed");
                    continue;
                }
            };

            info!(id = claimed.id, path = %claimed.file_path.display(), "job claimed");
            self.metrics.write().await.scheduler.claimed += 1;
            summary.claimed += 1;

            let scheduler = self.clone();
            let cancel = cancel.clone();
            jobs.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                scheduler.execute_job(claimed, &cancel).await
            });
        }

        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(JobOutcome::Completed { .. }) => summary.completed += 1,
                Ok(JobOutcome::Failed { .. }) => summary.failed += 1,
                Ok(JobOutcome::Released) => summary.released += 1,
                Ok(JobOutcome::Cancelled) => summary.cancelled += 1,
                Ok(JobOutcome::Discarded) => summary.discarded += 1,
                Ok(JobOutcome::Abandoned) => {}
                Err(e) => error!(error = %e, "job task panicked"),
            }
        }

        self.refresh_table_counts().await;
        summary
    }

    fn reserve_output(&self, output: &Path) -> Option<OutputGuard> {
        let mut busy = self.busy_outputs.lock().unwrap_or_else(|e| e.into_inner());
        if !busy.insert(output.to_path_buf()) {
            return None;
        }
        Some(OutputGuard {
            busy: self.busy_outputs.clone(),
            output: output.to_path_buf(),
        })
    }

    /// Run one claimed job to its terminal state.
    pub async fn execute_job(&self, record: JobRecord, cancel: &CancellationToken) -> JobOutcome {
        let input = record.file_path.clone();
        let output = output_path_for(&self.settings.output_dir, &input);

        if let Err(e) = prepare_output(&output) {
            let reason = format!("cannot prepare {}: {}", output.display(), e);
            return self.finish(&record, record.failed(reason.clone()), || {
                JobOutcome::Failed { reason }
            })
            .await;
        }

        let size_before = tokio::fs::metadata(&input).await.map(|m| m.len()).unwrap_or(0);
        let encoder = video_encoder_name(self.settings.policy.codec, self.settings.policy.hw_accel);
        let args = build_ffmpeg_args(&FfmpegEncodeParams::new(
            input.clone(),
            output.clone(),
            self.settings.policy,
        ));

        self.metrics.write().await.running.push(RunningJob {
            id: record.id,
            input_path: input.to_string_lossy().into_owned(),
            output_path: output.to_string_lossy().into_owned(),
            encoder: encoder.to_string(),
            started_at_unix_ms: current_timestamp_ms(),
            size_in_bytes_before: size_before,
        });

        let result = run_process(&self.settings.ffmpeg_path, &args, cancel).await;
        self.metrics.write().await.remove_running(record.id);

        match result {
            Ok(out) if out.success() => {
                let outcome = self
                    .finish(&record, record.completed(&output), || JobOutcome::Completed {
                        output: output.clone(),
                    })
                    .await;
                if matches!(outcome, JobOutcome::Completed { .. }) {
                    let size_after = tokio::fs::metadata(&output).await.map(|m| m.len()).unwrap_or(0);
                    {
                        let mut m = self.metrics.write().await;
                        m.scheduler.total_bytes_in += size_before;
                        m.scheduler.total_bytes_out += size_after;
                    }
                    info!(
                        id = record.id,
                        path = %input.display(),
                        output = %output.display(),
                        size_before,
                        size_after,
                        "compression finished"
                    );
                    if self.settings.policy.delete_source_on_success {
                        self.remove_source(&input).await;
                    }
                }
                outcome
            }
            Ok(out) => {
                remove_partial(&output).await;
                let reason = match out.exit_code {
                    Some(code) => format!("ffmpeg exited with code {}: {}", code, out.stderr_tail(ERROR_MESSAGE_BYTES)),
                    None => format!("ffmpeg killed by signal: {}", out.stderr_tail(ERROR_MESSAGE_BYTES)),
                };
                warn!(id = record.id, path = %input.display(), %reason, "compression failed");
                self.finish(&record, record.failed(reason.clone()), || JobOutcome::Failed { reason })
                    .await
            }
            Err(RunError::Cancelled) => {
                remove_partial(&output).await;
                info!(id = record.id, path = %input.display(), "compression cancelled");
                self.metrics.write().await.scheduler.cancelled += 1;
                JobOutcome::Cancelled
            }
            Err(RunError::ExecutableNotFound(exe)) => {
                error!(id = record.id, exe = %exe.display(), "transcoder vanished, releasing job");
                self.finish(&record, record.released(), || JobOutcome::Released)
                    .await
            }
            Err(e) => {
                remove_partial(&output).await;
                let reason = e.to_string();
                warn!(id = record.id, path = %input.display(), %reason, "compression fault");
                self.finish(&record, record.failed(reason.clone()), || JobOutcome::Failed { reason })
                    .await
            }
        }
    }

    /// Write a terminal update for a claimed job.
    ///
    /// Losing the race is not an error: whoever changed the row is ahead.
    async fn finish(
        &self,
        claimed: &JobRecord,
        next: JobRecord,
        outcome: impl FnOnce() -> JobOutcome,
    ) -> JobOutcome {
        let store = &self.store;
        let written = self
            .store_retry
            .run(StoreError::is_transient, || {
                let next = &next;
                async move { store.update_conditional(next) }
            })
            .await;

        match written {
            Ok(stored) => {
                let outcome = outcome();
                let mut m = self.metrics.write().await;
                match outcome {
                    JobOutcome::Completed { .. } => m.scheduler.completed += 1,
                    JobOutcome::Failed { .. } => m.scheduler.failed += 1,
                    JobOutcome::Released => m.scheduler.released += 1,
                    _ => {}
                }
                debug!(id = stored.id, version = stored.version, status = %stored.status, "job updated");
                outcome
            }
            Err(
                StoreError::VersionConflict { .. }
                | StoreError::NotFound(_)
                | StoreError::InvalidTransition { .. },
            ) => {
                debug!(id = claimed.id, "terminal update lost its race, discarding");
                self.metrics.write().await.scheduler.discarded += 1;
                JobOutcome::Discarded
            }
            Err(e) => {
                error!(id = claimed.id, error = %e, "failed to record job outcome");
                JobOutcome::Abandoned
            }
        }
    }

    async fn remove_source(&self, input: &Path) {
        match tokio::fs::remove_file(input).await {
            Ok(()) => info!(path = %input.display(), "source removed"),
            Err(e) => warn!(path = %input.display(), error = %e, "failed to remove source"),
        }
    }

    async fn refresh_table_counts(&self) {
        match self.store.status_counts() {
            Ok(counts) => {
                let mut m = self.metrics.write().await;
                m.table = counts;
                m.touch();
            }
            Err(e) => debug!(error = %e, "failed to count jobs"),
        }
    }
}

fn prepare_output(output: &Path) -> std::io::Result<()> {
    if let Some(dir) = output.parent() {
        std::fs::create_dir_all(dir)?;
    }
    if let Some(moved) = archive_existing_output(output)? {
        info!(from = %output.display(), to = %moved.display(), "existing output moved aside");
    }
    Ok(())
}

async fn remove_partial(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => debug!(path = %output.display(), "partial output removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %output.display(), error = %e, "failed to remove partial output"),
    }
}
