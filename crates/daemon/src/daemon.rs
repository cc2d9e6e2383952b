//! Daemon startup and main loop for compressd
//!
//! Wires the job store, ingest monitor, compression scheduler and metrics
//! server together and runs them until shutdown.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::metrics::{new_shared_metrics, SharedMetrics};
use crate::metrics_server::{run_metrics_server, ServerError};
use crate::monitor::{IngestError, IngestMonitor, ScanSummary};
use crate::scan::ScanFilter;
use crate::scheduler::{CompressionScheduler, SchedulerSettings};
use crate::settle::RetryPolicy;
use crate::startup::{prepare_directories, run_startup_checks, StartupError};
use crate::store::{JobStore, StoreError};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Cannot resolve {path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration with input and output dirs made absolute
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    /// Shared metrics state
    pub metrics: SharedMetrics,
    store: JobStore,
    monitor: IngestMonitor,
    scheduler: CompressionScheduler,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file
    /// 2. Apply environment overrides
    /// 3. Run startup checks (directories, ffmpeg, hardware encoder)
    /// 4. Open the job store and derive the concurrency plan
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config)
    }

    /// Initialize the daemon with an existing configuration
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::build(config)
    }

    /// Initialize the daemon without probing the transcoder
    ///
    /// Directories are still prepared since everything else depends on them.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        prepare_directories(&config)?;
        Self::build(config)
    }

    fn build(mut config: Config) -> Result<Self, DaemonError> {
        config.paths.input_dir = canonical(&config.paths.input_dir)?;
        config.paths.output_dir = canonical(&config.paths.output_dir)?;

        let store = JobStore::open(&config.paths.database_path)?;
        let concurrency_plan = derive_plan(&config);
        let metrics = new_shared_metrics();

        let filter = ScanFilter::new(
            &config.paths.input_dir,
            &config.paths.output_dir,
            &config.monitor.extensions,
        );
        let monitor = IngestMonitor::new(
            store.clone(),
            filter,
            Duration::from_millis(config.monitor.settle_millis),
            RetryPolicy::new(
                config.monitor.retry_attempts,
                Duration::from_millis(config.monitor.retry_base_millis),
            ),
            metrics.clone(),
        );
        let scheduler = CompressionScheduler::new(
            store.clone(),
            SchedulerSettings::from_config(&config, &concurrency_plan),
            metrics.clone(),
        );

        Ok(Self {
            config,
            concurrency_plan,
            metrics,
            store,
            monitor,
            scheduler,
        })
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Reset abandoned claims, then reconcile the table with the input tree.
    pub async fn recover(&self) -> Result<ScanSummary, DaemonError> {
        let threshold = Duration::from_secs(self.config.scheduler.stale_claim_secs);
        let reset = self.store.reset_stale_claims(threshold)?;
        if reset > 0 {
            warn!(count = reset, "reset stale claims to pending");
        }

        Ok(self.monitor.initial_scan().await?)
    }

    /// Run until `shutdown` resolves or a background task fails.
    ///
    /// The watcher is registered before recovery scans the tree, so changes
    /// made during the scan are buffered and handled once the loop starts.
    /// On the way out every task is cancelled and given the configured grace
    /// period; whatever is still running after that is aborted.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        let stream = self.monitor.subscribe()?;
        let recovered = self.recover().await?;

        let cancel = CancellationToken::new();
        let mut tasks: JoinSet<Result<(), DaemonError>> = JoinSet::new();

        {
            let monitor = self.monitor.clone();
            let cancel = cancel.clone();
            let deferred = recovered.deferred_paths;
            tasks.spawn(async move {
                monitor.run_watch(stream, deferred, cancel).await;
                Ok(())
            });
        }
        {
            let scheduler = self.scheduler.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                scheduler.run(cancel).await;
                Ok(())
            });
        }
        if self.config.metrics.enabled {
            let metrics = self.metrics.clone();
            let listen = self.config.metrics.listen.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                run_metrics_server(metrics, &listen, cancel)
                    .await
                    .map_err(DaemonError::from)
            });
        }

        info!(
            input = %self.config.paths.input_dir.display(),
            output = %self.config.paths.output_dir.display(),
            workers = self.concurrency_plan.max_concurrent_jobs,
            "daemon running"
        );

        let mut first_error = None;
        tokio::select! {
            _ = shutdown => info!("shutdown requested"),
            Some(joined) = tasks.join_next() => {
                first_error = task_error(joined);
                if first_error.is_none() {
                    warn!("background task exited early, shutting down");
                }
            }
        }

        cancel.cancel();
        let grace = Duration::from_secs(self.config.scheduler.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Some(e) = task_error(joined) {
                    first_error.get_or_insert(e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(grace_secs = grace.as_secs(), "tasks still running after grace period, aborting");
            tasks.shutdown().await;
        }

        info!("daemon stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run until Ctrl-C or SIGTERM.
    pub async fn run_until_signal(&self) -> Result<(), DaemonError> {
        self.run(shutdown_signal()).await
    }
}

/// Resolves on Ctrl-C, or on SIGTERM where there is one.
///
/// The SIGTERM listener is installed on call, before the first poll.
fn shutdown_signal() -> impl Future<Output = ()> {
    #[cfg(unix)]
    let terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());

    async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            match terminate {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("ctrl-c received"),
            _ = terminate => info!("SIGTERM received"),
        }
    }
}

fn canonical(path: &Path) -> Result<PathBuf, DaemonError> {
    path.canonicalize().map_err(|source| DaemonError::Path {
        path: path.to_path_buf(),
        source,
    })
}

fn task_error(
    joined: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Option<DaemonError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            error!(error = %e, "background task failed");
            Some(e)
        }
        Err(e) => {
            error!(error = %e, "background task panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobRecord, JobStatus};
    use tempfile::TempDir;

    fn create_test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.paths.input_dir = dir.join("in");
        config.paths.output_dir = dir.join("out");
        config.paths.database_path = dir.join("jobs.db");
        config.scheduler.max_concurrent_jobs = 1;
        config.scheduler.poll_interval_secs = 1;
        config.monitor.settle_millis = 50;
        config.metrics.enabled = false;
        std::fs::create_dir_all(dir.join("in")).unwrap();
        config
    }

    #[test]
    fn test_daemon_initialization_without_checks() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(dir.path());
        let daemon = Daemon::new_without_checks(config).unwrap();

        assert_eq!(daemon.concurrency_plan.max_concurrent_jobs, 1);
        assert!(daemon.config.paths.input_dir.is_absolute());
        assert!(daemon.config.paths.output_dir.is_dir());
        assert!(dir.path().join("jobs.db").exists());
    }

    #[test]
    fn test_missing_input_dir_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(dir.path());
        config.paths.input_dir = dir.path().join("missing");
        assert!(matches!(
            Daemon::new_without_checks(config),
            Err(DaemonError::Startup(StartupError::InputDirMissing(_)))
        ));
    }

    #[tokio::test]
    async fn test_recover_resets_stale_claims_and_scans() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(dir.path());
        config.scheduler.stale_claim_secs = 0;
        let daemon = Daemon::new_without_checks(config).unwrap();

        let input = daemon.config.paths.input_dir.clone();
        let tracked = input.join("tracked.mp4");
        std::fs::write(&tracked, b"a").unwrap();
        std::fs::write(input.join("new.mp4"), b"b").unwrap();

        let store = daemon.store();
        let id = store.insert(&JobRecord::new_pending(&tracked, "old")).unwrap();
        let record = store.find_by_id(id).unwrap().unwrap();
        store.update_conditional(&record.claimed()).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let summary = daemon.recover().await.unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.marked_pending, 1);

        let counts = store.status_counts().unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.compressing, 0);
    }

    #[tokio::test]
    async fn test_run_returns_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new_without_checks(create_test_config(dir.path())).unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            daemon.run(tokio::time::sleep(Duration::from_millis(100))),
        )
        .await
        .expect("daemon did not stop");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bad_metrics_address_stops_daemon() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(dir.path());
        config.metrics.enabled = true;
        config.metrics.listen = "not an address".to_string();
        let daemon = Daemon::new_without_checks(config).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            daemon.run(std::future::pending::<()>()),
        )
        .await
        .expect("daemon did not stop");
        assert!(matches!(
            result,
            Err(DaemonError::Server(ServerError::InvalidAddress(_)))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_end_to_end_compression() {
        use crate::encode::runner::test_support::write_script;

        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(dir.path());
        config.paths.ffmpeg_path = write_script(
            dir.path(),
            "ffmpeg",
            "for last; do :; done\nprintf 'encoded' > \"$last\"",
        );
        std::fs::write(config.paths.input_dir.join("early.mp4"), b"before start").unwrap();
        let daemon = Daemon::new_without_checks(config).unwrap();
        let input = daemon.config.paths.input_dir.clone();
        let output = daemon.config.paths.output_dir.clone();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let store = daemon.store().clone();
        let driver = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            std::fs::write(input.join("late.mp4"), b"after start").unwrap();

            for _ in 0..150 {
                let done = store
                    .list_all()
                    .unwrap()
                    .iter()
                    .filter(|r| r.status == JobStatus::Done)
                    .count();
                if done == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let _ = stop_tx.send(());
        };

        let (result, ()) = tokio::join!(
            daemon.run(async {
                let _ = stop_rx.await;
            }),
            driver
        );
        result.unwrap();

        assert_eq!(store.status_counts().unwrap().done, 2);
        assert!(output.join("compressed_early.mp4").exists());
        assert!(output.join("compressed_late.mp4").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_quick_restart_recovers_claim_while_running() {
        use crate::encode::runner::test_support::write_script;

        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(dir.path());
        config.scheduler.stale_claim_secs = 1;
        config.paths.ffmpeg_path = write_script(
            dir.path(),
            "ffmpeg",
            "for last; do :; done\nprintf 'encoded' > \"$last\"",
        );
        let clip = config.paths.input_dir.join("clip.mp4");
        std::fs::write(&clip, b"frames").unwrap();

        // First run claims the row and dies before finishing it.
        let id = {
            let daemon = Daemon::new_without_checks(config.clone()).unwrap();
            let store = daemon.store();
            let clip = daemon.config.paths.input_dir.join("clip.mp4");
            let hash = crate::hash::compute_hash(&clip).unwrap();
            let id = store.insert(&JobRecord::new_pending(&clip, hash)).unwrap();
            let record = store.find_by_id(id).unwrap().unwrap();
            store.update_conditional(&record.claimed()).unwrap();
            id
        };

        let daemon = Daemon::new_without_checks(config).unwrap();
        daemon.recover().await.unwrap();
        assert_eq!(
            daemon.store().find_by_id(id).unwrap().unwrap().status,
            JobStatus::Compressing
        );

        let store = daemon.store().clone();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let driver = async {
            for _ in 0..100 {
                let status = store.find_by_id(id).unwrap().unwrap().status;
                if status == JobStatus::Done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let _ = stop_tx.send(());
        };
        let (result, ()) = tokio::join!(
            daemon.run(async {
                let _ = stop_rx.await;
            }),
            driver
        );
        result.unwrap();

        assert_eq!(store.find_by_id(id).unwrap().unwrap().status, JobStatus::Done);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_stops_daemon() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new_without_checks(create_test_config(dir.path())).unwrap();

        let sender = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let status = std::process::Command::new("kill")
                .args(["-TERM", &std::process::id().to_string()])
                .status()
                .unwrap();
            assert!(status.success());
        };
        let (result, ()) = tokio::time::timeout(
            Duration::from_secs(10),
            async { tokio::join!(daemon.run_until_signal(), sender) },
        )
        .await
        .expect("daemon ignored SIGTERM");
        assert!(result.is_ok());
    }
}
