//! compressd
//!
//! Background service that watches an input tree, keeps a SQLite job table in
//! step with it, and compresses queued videos through ffmpeg.

pub mod concurrency;
pub mod daemon;
pub mod encode;
pub mod hash;
pub mod jobs;
pub mod metrics;
pub mod metrics_server;
pub mod monitor;
pub mod scan;
pub mod scheduler;
pub mod settle;
pub mod startup;
pub mod store;

pub use compressd_config as config;
pub use compressd_config::Config;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError};
pub use encode::{build_ffmpeg_args, run_process, FfmpegEncodeParams, ProcessOutput, RunError};
pub use hash::{compute_hash, compute_hash_async};
pub use jobs::{JobRecord, JobStatus};
pub use metrics::{new_shared_metrics, MetricsSnapshot, RunningJob, SharedMetrics};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use monitor::{IngestError, IngestMonitor, Outcome, ScanSummary};
pub use scan::{scan_dir, ScanFilter};
pub use scheduler::{CompressionScheduler, CycleSummary, JobOutcome, SchedulerSettings};
pub use settle::RetryPolicy;
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError};
pub use store::{JobStore, StatusCounts, StoreError};
