//! Input directory monitor.
//!
//! Keeps the job table in step with the files under the input directory: a
//! full scan at startup, then live notifications. Every notification gets its
//! own handler task that waits out the settle window, re-checks the
//! filesystem, and writes through the store's conditional operations. Handlers
//! share nothing but the store.

use crate::hash::compute_hash_async;
use crate::jobs::{JobRecord, JobStatus};
use crate::metrics::SharedMetrics;
use crate::scan::{scan_dir, ScanFilter};
use crate::settle::{settle, RetryPolicy};
use crate::store::{JobStore, StoreError};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Floor for re-checking a row whose change was deferred.
const MIN_RELEASE_POLL: Duration = Duration::from_millis(100);

/// Errors raised while reconciling one path.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

impl IngestError {
    fn io(path: &Path, source: io::Error) -> Self {
        IngestError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the event is worth another attempt after a backoff.
    ///
    /// A file that vanished mid-read is not: its removal event will follow.
    pub fn is_transient(&self) -> bool {
        match self {
            IngestError::Io { source, .. } => source.kind() != io::ErrorKind::NotFound,
            IngestError::Store(e) => e.is_transient(),
            IngestError::Watch { .. } => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, IngestError::Store(StoreError::VersionConflict { .. }))
    }
}

/// What reconciling a path did to the job table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Inserted,
    MarkedPending,
    Unchanged,
    /// Content changed while an encode is running; reconciled again once it ends.
    Deferred,
    /// Number of records retired.
    Removed(usize),
    /// Path not tracked, or the filesystem no longer matches the event.
    Ignored,
}

/// Totals from one full scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub inserted: usize,
    pub marked_pending: usize,
    pub unchanged: usize,
    pub deferred: usize,
    pub removed: usize,
    pub failed: usize,
    /// Files whose content changed while their encode was running. The
    /// watcher keeps an eye on these until the encode lets go of the row.
    pub deferred_paths: Vec<PathBuf>,
}

/// A registered watcher and the changes it has buffered so far.
///
/// Registering before the initial scan means nothing that happens during the
/// scan is missed.
pub struct WatchStream {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<FsChange>,
}

/// A filesystem change as reported by the watcher, before settling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    /// Created, written, or renamed into place.
    Present(PathBuf),
    /// Deleted or renamed away.
    Removed(PathBuf),
    /// Rename with no direction; resolved by looking at the filesystem.
    Unknown(PathBuf),
}

impl FsChange {
    pub fn path(&self) -> &Path {
        match self {
            FsChange::Present(p) | FsChange::Removed(p) | FsChange::Unknown(p) => p,
        }
    }
}

/// Map a notify event onto the changes it implies.
///
/// A rename reported with both ends becomes a removal of the old path and a
/// new file at the new path. Access and metadata events are ignored.
pub fn classify_event(event: &Event) -> Vec<FsChange> {
    match event.kind {
        EventKind::Create(_) => event.paths.iter().cloned().map(FsChange::Present).collect(),
        EventKind::Remove(_) => event.paths.iter().cloned().map(FsChange::Removed).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().cloned().map(FsChange::Removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().cloned().map(FsChange::Present).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => vec![
            FsChange::Removed(event.paths[0].clone()),
            FsChange::Present(event.paths[1].clone()),
        ],
        EventKind::Modify(ModifyKind::Name(_)) => {
            event.paths.iter().cloned().map(FsChange::Unknown).collect()
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => event.paths.iter().cloned().map(FsChange::Present).collect(),
        _ => Vec::new(),
    }
}

/// Latest notification generation per path.
///
/// A handler only acts if no newer notification for its path arrived while it
/// was settling, so a burst of writes produces one reconcile.
#[derive(Clone, Default)]
struct Generations {
    latest: Arc<Mutex<HashMap<PathBuf, u64>>>,
    counter: Arc<AtomicU64>,
}

impl Generations {
    fn bump(&self, path: &Path) -> u64 {
        let generation = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let mut map = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(path.to_path_buf(), generation);
        generation
    }

    /// Whether a notification newer than `generation` arrived for `path`.
    fn is_superseded(&self, path: &Path, generation: u64) -> bool {
        let map = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        map.get(path).is_some_and(|&latest| latest > generation)
    }

    fn take_if_latest(&self, path: &Path, generation: u64) -> bool {
        let mut map = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        if map.get(path) == Some(&generation) {
            map.remove(path);
            true
        } else {
            false
        }
    }
}

/// Reconciles the input directory against the job table.
#[derive(Clone)]
pub struct IngestMonitor {
    store: JobStore,
    filter: ScanFilter,
    settle_window: Duration,
    retry: RetryPolicy,
    metrics: SharedMetrics,
    generations: Generations,
}

impl IngestMonitor {
    pub fn new(
        store: JobStore,
        filter: ScanFilter,
        settle_window: Duration,
        retry: RetryPolicy,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            filter,
            settle_window,
            retry,
            metrics,
            generations: Generations::default(),
        }
    }

    /// Walk the whole input tree once.
    ///
    /// Every accepted file is hashed and upserted; afterwards any record whose
    /// file no longer exists is retired. Per-file failures are logged and
    /// counted, never fatal.
    pub async fn initial_scan(&self) -> Result<ScanSummary, IngestError> {
        let root = self.filter.root().to_path_buf();
        let filter = self.filter.clone();
        let files = tokio::task::spawn_blocking(move || scan_dir(&root, &filter))
            .await
            .map_err(|e| {
                IngestError::io(self.filter.root(), io::Error::new(io::ErrorKind::Other, e))
            })?;

        let mut summary = ScanSummary::default();
        for file in &files {
            match self.with_retry(|| self.reconcile_present(file)).await {
                Ok(Outcome::Inserted) => summary.inserted += 1,
                Ok(Outcome::MarkedPending) => summary.marked_pending += 1,
                Ok(Outcome::Deferred) => {
                    summary.deferred += 1;
                    summary.deferred_paths.push(file.clone());
                }
                Ok(_) => summary.unchanged += 1,
                Err(e) if e.is_conflict() => {
                    self.metrics.write().await.ingest.conflicts += 1;
                }
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "scan: giving up on file");
                    self.metrics.write().await.ingest.dropped_events += 1;
                    summary.failed += 1;
                }
            }
        }

        for record in self.store.list_all()? {
            if path_exists(&record.file_path).await? {
                continue;
            }
            match self.retire(record).await {
                Ok(true) => summary.removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "scan: failed to retire record");
                    summary.failed += 1;
                }
            }
        }

        info!(
            files = files.len(),
            inserted = summary.inserted,
            marked_pending = summary.marked_pending,
            removed = summary.removed,
            failed = summary.failed,
            "initial scan complete"
        );
        Ok(summary)
    }

    /// Hash `path` and bring its record in line.
    ///
    /// Unknown paths are inserted as Pending; a changed hash sends a Done or
    /// Failed record back to Pending. A record that is mid-encode is left
    /// alone.
    pub async fn reconcile_present(&self, path: &Path) -> Result<Outcome, IngestError> {
        if !self.filter.accepts(path) {
            return Ok(Outcome::Ignored);
        }
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Ok(Outcome::Ignored),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Outcome::Ignored),
            Err(e) => return Err(IngestError::io(path, e)),
        }

        let hash = compute_hash_async(path.to_path_buf())
            .await
            .map_err(|e| IngestError::io(path, e))?;

        let existing = match self.store.find_by_path(path)? {
            Some(record) => record,
            None => match self.store.insert(&JobRecord::new_pending(path, hash.clone())) {
                Ok(id) => {
                    info!(path = %path.display(), id, "new file queued");
                    self.metrics.write().await.ingest.inserted += 1;
                    return Ok(Outcome::Inserted);
                }
                // Another handler inserted first; fall through to the update path.
                Err(StoreError::DuplicatePath(p)) => self
                    .store
                    .find_by_path(path)?
                    .ok_or(StoreError::DuplicatePath(p))?,
                Err(e) => return Err(e.into()),
            },
        };

        self.apply_hash(existing, hash).await
    }

    async fn apply_hash(&self, record: JobRecord, hash: String) -> Result<Outcome, IngestError> {
        if record.content_hash == hash {
            return Ok(Outcome::Unchanged);
        }
        if record.status == JobStatus::Compressing {
            info!(
                path = %record.file_path.display(),
                id = record.id,
                "content changed during encode, leaving for the next scan"
            );
            return Ok(Outcome::Deferred);
        }

        let updated = self.store.update_conditional(&record.rehashed(hash))?;
        info!(
            path = %updated.file_path.display(),
            id = updated.id,
            version = updated.version,
            "content changed, requeued"
        );
        self.metrics.write().await.ingest.marked_pending += 1;
        Ok(Outcome::MarkedPending)
    }

    /// Retire the record for `path`, or every record beneath it when `path`
    /// was a directory, provided the files are really gone.
    pub async fn reconcile_removed(&self, path: &Path) -> Result<Outcome, IngestError> {
        if path_exists(path).await? {
            return Ok(Outcome::Ignored);
        }

        let records = match self.store.find_by_path(path)? {
            Some(record) => vec![record],
            None => self.store.list_under(path)?,
        };

        let mut removed = 0;
        for record in records {
            if self.retire(record).await? {
                removed += 1;
            }
        }
        Ok(Outcome::Removed(removed))
    }

    /// Delete a record whose file is gone.
    ///
    /// The missing file decides the outcome, so a version conflict here means
    /// re-reading the row and trying again rather than giving up; otherwise a
    /// row finishing its encode at the same moment would be orphaned.
    async fn retire(&self, mut record: JobRecord) -> Result<bool, IngestError> {
        for _ in 0..self.retry.attempts.max(1) {
            if path_exists(&record.file_path).await? {
                return Ok(false);
            }
            match self.store.delete_conditional(record.id, record.version) {
                Ok(()) => {
                    info!(
                        path = %record.file_path.display(),
                        id = record.id,
                        status = %record.status,
                        "file removed, job retired"
                    );
                    self.metrics.write().await.ingest.removed += 1;
                    return Ok(true);
                }
                Err(StoreError::NotFound(_)) => return Ok(false),
                Err(StoreError::VersionConflict { .. }) => {
                    self.metrics.write().await.ingest.conflicts += 1;
                    match self.store.find_by_id(record.id)? {
                        Some(fresh) => record = fresh,
                        None => return Ok(false),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Reconcile whatever `change` points at now that it has settled.
    pub async fn apply_change(&self, change: &FsChange) -> Result<Outcome, IngestError> {
        let path = change.path();
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(IngestError::io(path, e)),
        };

        match (change, meta) {
            (FsChange::Removed(_), Some(_)) => Ok(Outcome::Ignored),
            (FsChange::Present(_), None) => Ok(Outcome::Ignored),
            (_, None) => self.reconcile_removed(path).await,
            (_, Some(meta)) if meta.is_dir() => self.ingest_dir(path).await,
            (_, Some(_)) => self.reconcile_present(path).await,
        }
    }

    /// Ingest every file under a directory that appeared in the tree.
    async fn ingest_dir(&self, dir: &Path) -> Result<Outcome, IngestError> {
        let filter = self.filter.clone();
        let owned = dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || scan_dir(&owned, &filter))
            .await
            .map_err(|e| IngestError::io(dir, io::Error::new(io::ErrorKind::Other, e)))?;

        debug!(dir = %dir.display(), files = files.len(), "directory appeared");
        let mut inserted = 0;
        for file in files {
            match self.with_retry(|| self.reconcile_present(&file)).await {
                Ok(Outcome::Inserted) | Ok(Outcome::MarkedPending) => inserted += 1,
                Ok(_) => {}
                Err(e) => self.drop_event(&file, &e).await,
            }
        }
        Ok(if inserted > 0 {
            Outcome::Inserted
        } else {
            Outcome::Unchanged
        })
    }

    async fn with_retry<F, Fut>(&self, op: F) -> Result<Outcome, IngestError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Outcome, IngestError>>,
    {
        self.retry.run(IngestError::is_transient, op).await
    }

    async fn drop_event(&self, path: &Path, err: &IngestError) {
        if err.is_conflict() {
            debug!(path = %path.display(), "lost a version race, dropping event");
            self.metrics.write().await.ingest.conflicts += 1;
        } else {
            warn!(path = %path.display(), error = %err, "giving up on event");
            self.metrics.write().await.ingest.dropped_events += 1;
        }
    }

    /// Settle, then reconcile, unless a newer event for the same path arrived.
    ///
    /// A change deferred because the row is mid-encode is not dropped: the
    /// handler waits for the scheduler to let go of the row and reconciles
    /// again, so the new content is queued once the old encode is recorded.
    async fn handle_change(&self, change: FsChange, generation: u64) {
        settle(self.settle_window).await;
        if !self.generations.take_if_latest(change.path(), generation) {
            return;
        }

        let path = change.path();
        let mut result = self.with_retry(|| self.apply_change(&change)).await;
        while let Ok(Outcome::Deferred) = result {
            if !self.wait_for_release(path, generation).await {
                return;
            }
            result = self.with_retry(|| self.reconcile_present(path)).await;
        }

        match result {
            Ok(outcome) => debug!(path = %path.display(), ?outcome, "event reconciled"),
            Err(e) => self.drop_event(path, &e).await,
        }
    }

    /// Poll until `path`'s row is no longer Compressing.
    ///
    /// Returns false when a newer notification for the path took over.
    async fn wait_for_release(&self, path: &Path, generation: u64) -> bool {
        let interval = self.settle_window.max(MIN_RELEASE_POLL);
        loop {
            tokio::time::sleep(interval).await;
            if self.generations.is_superseded(path, generation) {
                return false;
            }
            match self.store.find_by_path(path) {
                Ok(Some(record)) if record.status == JobStatus::Compressing => continue,
                Ok(_) => return true,
                Err(e) if e.is_transient() => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot re-check deferred change");
                    return false;
                }
            }
        }
    }

    /// Register a recursive watcher on the input root.
    ///
    /// Changes are buffered until [`IngestMonitor::run_watch`] consumes them.
    pub fn subscribe(&self) -> Result<WatchStream, IngestError> {
        let root = self.filter.root().to_path_buf();
        let (tx, rx) = mpsc::unbounded_channel::<FsChange>();

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for change in classify_event(&event) {
                        let _ = tx.send(change);
                    }
                }
                Err(e) => warn!(error = %e, "watch error"),
            })
            .map_err(|source| IngestError::Watch {
                path: root.clone(),
                source,
            })?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|source| IngestError::Watch {
                path: root.clone(),
                source,
            })?;
        info!(dir = %root.display(), "watching input directory");

        Ok(WatchStream {
            _watcher: watcher,
            rx,
        })
    }

    /// Subscribe and watch the input tree until `cancel` fires.
    pub async fn watch(&self, cancel: CancellationToken) -> Result<(), IngestError> {
        let stream = self.subscribe()?;
        self.run_watch(stream, Vec::new(), cancel).await;
        Ok(())
    }

    /// Handle buffered and live changes until `cancel` fires.
    ///
    /// `follow_up` lists paths whose change was deferred during the initial
    /// scan. Handlers still settling at shutdown are aborted; anything they
    /// would have done is redone by the next startup scan.
    pub async fn run_watch(
        &self,
        stream: WatchStream,
        follow_up: Vec<PathBuf>,
        cancel: CancellationToken,
    ) {
        let WatchStream { _watcher: watcher, mut rx } = stream;
        let mut handlers = JoinSet::new();

        for path in follow_up {
            self.spawn_handler(&mut handlers, FsChange::Present(path));
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = rx.recv() => {
                    let Some(change) = change else { break };
                    if self.filter.is_excluded(change.path()) {
                        continue;
                    }
                    debug!(?change, "filesystem event");
                    self.spawn_handler(&mut handlers, change);
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        drop(watcher);
        handlers.shutdown().await;
        info!("input watcher stopped");
    }

    fn spawn_handler(&self, handlers: &mut JoinSet<()>, change: FsChange) {
        let generation = self.generations.bump(change.path());
        let monitor = self.clone();
        handlers.spawn(async move { monitor.handle_change(change, generation).await });
    }
}

async fn path_exists(path: &Path) -> Result<bool, IngestError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| IngestError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::new_shared_metrics;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        input: PathBuf,
        store: JobStore,
        monitor: IngestMonitor,
        metrics: SharedMetrics,
    }

    fn fixture(settle_ms: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        fs::create_dir_all(&input).unwrap();
        let store = JobStore::open_in_memory().unwrap();
        let metrics = new_shared_metrics();
        let monitor = IngestMonitor::new(
            store.clone(),
            ScanFilter::new(&input, dir.path().join("out"), &[]),
            Duration::from_millis(settle_ms),
            RetryPolicy::new(3, Duration::from_millis(5)),
            metrics.clone(),
        );
        Fixture {
            _dir: dir,
            input,
            store,
            monitor,
            metrics,
        }
    }

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut ev = Event::new(kind);
        for p in paths {
            ev = ev.add_path(PathBuf::from(p));
        }
        ev
    }

    #[test]
    fn test_classify_event() {
        assert_eq!(
            classify_event(&event(EventKind::Create(CreateKind::File), &["/in/a.mp4"])),
            vec![FsChange::Present("/in/a.mp4".into())]
        );
        assert_eq!(
            classify_event(&event(EventKind::Remove(RemoveKind::Any), &["/in/a.mp4"])),
            vec![FsChange::Removed("/in/a.mp4".into())]
        );
        assert_eq!(
            classify_event(&event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/in/a.mp4", "/in/b.mp4"]
            )),
            vec![
                FsChange::Removed("/in/a.mp4".into()),
                FsChange::Present("/in/b.mp4".into())
            ]
        );
        assert_eq!(
            classify_event(&event(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                &["/in/a.mp4"]
            )),
            vec![FsChange::Removed("/in/a.mp4".into())]
        );
        assert_eq!(
            classify_event(&event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Any)),
                &["/in/a.mp4"]
            )),
            vec![FsChange::Unknown("/in/a.mp4".into())]
        );
        assert_eq!(
            classify_event(&event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["/in/a.mp4"]
            )),
            vec![FsChange::Present("/in/a.mp4".into())]
        );
        assert!(classify_event(&event(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            &["/in/a.mp4"]
        ))
        .is_empty());
    }

    #[tokio::test]
    async fn test_new_file_inserted_pending() {
        let fx = fixture(0);
        let clip = fx.input.join("clip.mp4");
        fs::write(&clip, b"frames").unwrap();

        assert_eq!(fx.monitor.reconcile_present(&clip).await.unwrap(), Outcome::Inserted);
        let record = fx.store.find_by_path(&clip).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.version, 1);
        assert_eq!(record.content_hash, crate::hash::compute_hash(&clip).unwrap());
        assert_eq!(fx.metrics.read().await.ingest.inserted, 1);
    }

    #[tokio::test]
    async fn test_rescan_unchanged_is_idempotent() {
        let fx = fixture(0);
        let clip = fx.input.join("clip.mp4");
        fs::write(&clip, b"frames").unwrap();
        fx.monitor.initial_scan().await.unwrap();

        let pending = fx.store.find_by_path(&clip).unwrap().unwrap();
        let claimed = fx.store.update_conditional(&pending.claimed()).unwrap();
        let done = fx
            .store
            .update_conditional(&claimed.completed("/out/compressed_clip.mp4"))
            .unwrap();

        let summary = fx.monitor.initial_scan().await.unwrap();
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.marked_pending, 0);
        let after = fx.store.find_by_path(&clip).unwrap().unwrap();
        assert_eq!(after, done);
    }

    #[tokio::test]
    async fn test_changed_content_requeues_done() {
        let fx = fixture(0);
        let clip = fx.input.join("clip.mp4");
        fs::write(&clip, b"v1").unwrap();
        fx.monitor.reconcile_present(&clip).await.unwrap();

        let v1 = fx.store.find_by_path(&clip).unwrap().unwrap();
        let v2 = fx.store.update_conditional(&v1.claimed()).unwrap();
        let v3 = fx
            .store
            .update_conditional(&v2.completed("/out/compressed_clip.mp4"))
            .unwrap();

        fs::write(&clip, b"v2").unwrap();
        assert_eq!(
            fx.monitor.reconcile_present(&clip).await.unwrap(),
            Outcome::MarkedPending
        );

        let v4 = fx.store.find_by_path(&clip).unwrap().unwrap();
        assert_eq!(v4.status, JobStatus::Pending);
        assert_eq!(v4.version, 4);
        assert_ne!(v4.content_hash, v3.content_hash);
        assert_eq!(v4.output_path, v3.output_path);
    }

    #[tokio::test]
    async fn test_change_during_encode_is_deferred() {
        let fx = fixture(0);
        let clip = fx.input.join("clip.mp4");
        fs::write(&clip, b"v1").unwrap();
        fx.monitor.reconcile_present(&clip).await.unwrap();
        let v1 = fx.store.find_by_path(&clip).unwrap().unwrap();
        let v2 = fx.store.update_conditional(&v1.claimed()).unwrap();

        fs::write(&clip, b"v2").unwrap();
        assert_eq!(fx.monitor.reconcile_present(&clip).await.unwrap(), Outcome::Deferred);
        assert_eq!(fx.store.find_by_path(&clip).unwrap().unwrap(), v2);
    }

    #[tokio::test]
    async fn test_removed_file_retired() {
        let fx = fixture(0);
        let clip = fx.input.join("clip.mp4");
        fs::write(&clip, b"frames").unwrap();
        fx.monitor.reconcile_present(&clip).await.unwrap();

        // Still on disk: nothing happens.
        assert_eq!(fx.monitor.reconcile_removed(&clip).await.unwrap(), Outcome::Ignored);

        fs::remove_file(&clip).unwrap();
        assert_eq!(
            fx.monitor.reconcile_removed(&clip).await.unwrap(),
            Outcome::Removed(1)
        );
        assert!(fx.store.find_by_path(&clip).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_removed_directory_retires_children() {
        let fx = fixture(0);
        let show = fx.input.join("show");
        fs::create_dir_all(&show).unwrap();
        fs::write(show.join("ep1.mp4"), b"1").unwrap();
        fs::write(show.join("ep2.mp4"), b"2").unwrap();
        fs::write(fx.input.join("keep.mp4"), b"k").unwrap();
        fx.monitor.initial_scan().await.unwrap();
        assert_eq!(fx.store.list_all().unwrap().len(), 3);

        fs::remove_dir_all(&show).unwrap();
        let outcome = fx
            .monitor
            .apply_change(&FsChange::Removed(show.clone()))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Removed(2));

        let left: Vec<PathBuf> = fx
            .store
            .list_all()
            .unwrap()
            .into_iter()
            .map(|r| r.file_path)
            .collect();
        assert_eq!(left, vec![fx.input.join("keep.mp4")]);
    }

    #[tokio::test]
    async fn test_rename_is_delete_plus_create() {
        let fx = fixture(0);
        let old = fx.input.join("old.mp4");
        let new = fx.input.join("new.mp4");
        fs::write(&old, b"frames").unwrap();
        fx.monitor.reconcile_present(&old).await.unwrap();
        let old_id = fx.store.find_by_path(&old).unwrap().unwrap().id;

        fs::rename(&old, &new).unwrap();
        let ev = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &[old.to_str().unwrap(), new.to_str().unwrap()],
        );
        for change in classify_event(&ev) {
            fx.monitor.apply_change(&change).await.unwrap();
        }

        assert!(fx.store.find_by_path(&old).unwrap().is_none());
        let renamed = fx.store.find_by_path(&new).unwrap().unwrap();
        assert_ne!(renamed.id, old_id);
        assert_eq!(renamed.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_created_directory_is_scanned() {
        let fx = fixture(0);
        let season = fx.input.join("season");
        fs::create_dir_all(season.join("disc1")).unwrap();
        fs::write(season.join("disc1/a.mp4"), b"a").unwrap();
        fs::write(season.join("b.mp4"), b"b").unwrap();

        fx.monitor
            .apply_change(&FsChange::Present(season))
            .await
            .unwrap();
        assert_eq!(fx.store.list_all().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_initial_scan_retires_vanished_files() {
        let fx = fixture(0);
        let gone = fx.input.join("gone.mp4");
        fx.store
            .insert(&JobRecord::new_pending(&gone, "stale"))
            .unwrap();

        let summary = fx.monitor.initial_scan().await.unwrap();
        assert_eq!(summary.removed, 1);
        assert!(fx.store.list_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retire_survives_concurrent_completion() {
        let fx = fixture(0);
        let clip = fx.input.join("clip.mp4");
        fs::write(&clip, b"frames").unwrap();
        fx.monitor.reconcile_present(&clip).await.unwrap();
        let v1 = fx.store.find_by_path(&clip).unwrap().unwrap();
        let v2 = fx.store.update_conditional(&v1.claimed()).unwrap();

        fs::remove_file(&clip).unwrap();
        // The encode finishes between the monitor's read and its delete.
        fx.store
            .update_conditional(&v2.completed("/out/compressed_clip.mp4"))
            .unwrap();
        assert!(fx.monitor.retire(v2).await.unwrap());
        assert!(fx.store.list_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_burst_of_events_reconciles_once() {
        let fx = fixture(20);
        let clip = fx.input.join("clip.mp4");
        fs::write(&clip, b"frames").unwrap();

        let first = fx.monitor.generations.bump(&clip);
        let second = fx.monitor.generations.bump(&clip);
        let a = fx.monitor.clone();
        let b = fx.monitor.clone();
        let c1 = FsChange::Present(clip.clone());
        let c2 = c1.clone();
        tokio::join!(a.handle_change(c1, first), b.handle_change(c2, second));

        assert_eq!(fx.metrics.read().await.ingest.inserted, 1);
        assert_eq!(fx.store.list_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_picks_up_new_file() {
        let fx = fixture(50);
        let cancel = CancellationToken::new();
        let monitor = fx.monitor.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { monitor.watch(token).await });

        // Give the watcher a moment to register.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let clip = fx.input.join("live.mp4");
        fs::write(&clip, b"frames").unwrap();

        let mut found = false;
        for _ in 0..50 {
            if fx.store.find_by_path(&clip).unwrap().is_some() {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(found, "watcher never queued the new file");
    }

    #[tokio::test]
    async fn test_deferred_change_requeued_after_encode() {
        let fx = fixture(20);
        let clip = fx.input.join("clip.mp4");
        fs::write(&clip, b"v1").unwrap();
        fx.monitor.reconcile_present(&clip).await.unwrap();
        let v1 = fx.store.find_by_path(&clip).unwrap().unwrap();
        let v2 = fx.store.update_conditional(&v1.claimed()).unwrap();

        fs::write(&clip, b"v2").unwrap();
        let generation = fx.monitor.generations.bump(&clip);
        let monitor = fx.monitor.clone();
        let change = FsChange::Present(clip.clone());
        let handler = tokio::spawn(async move { monitor.handle_change(change, generation).await });

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fx.store.find_by_path(&clip).unwrap().unwrap(), v2);

        // The encode of the old content finishes.
        fx.store
            .update_conditional(&v2.completed("/out/compressed_clip.mp4"))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), handler)
            .await
            .expect("deferred change never reconciled")
            .unwrap();

        let requeued = fx.store.find_by_path(&clip).unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.version, 4);
        assert_eq!(requeued.content_hash, crate::hash::compute_hash(&clip).unwrap());
    }

    #[tokio::test]
    async fn test_initial_scan_reports_deferred_paths() {
        let fx = fixture(0);
        let clip = fx.input.join("clip.mp4");
        fs::write(&clip, b"v1").unwrap();
        fx.monitor.initial_scan().await.unwrap();
        let v1 = fx.store.find_by_path(&clip).unwrap().unwrap();
        fx.store.update_conditional(&v1.claimed()).unwrap();

        fs::write(&clip, b"v2").unwrap();
        let summary = fx.monitor.initial_scan().await.unwrap();
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.deferred_paths, vec![clip]);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_then_dropped() {
        let mut fx = fixture(0);
        fx.monitor.retry = RetryPolicy::new(3, Duration::from_millis(20));
        // A regular file used as a directory fails with a non-NotFound error
        // on every attempt, even for a privileged user.
        let blocker = fx.input.join("blocker");
        fs::write(&blocker, b"not a dir").unwrap();
        let clip = blocker.join("clip.mp4");

        let generation = fx.monitor.generations.bump(&clip);
        let started = std::time::Instant::now();
        fx.monitor
            .handle_change(FsChange::Present(clip.clone()), generation)
            .await;

        // Two backoffs: 20ms then 40ms.
        assert!(started.elapsed() >= Duration::from_millis(60));
        let metrics = fx.metrics.read().await;
        assert_eq!(metrics.ingest.dropped_events, 1);
        assert_eq!(metrics.ingest.inserted, 0);
        assert!(fx.store.list_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_changes_before_watch_loop_are_buffered() {
        let fx = fixture(20);
        let stream = fx.monitor.subscribe().unwrap();

        // Written after registration but before anything consumes events,
        // as happens while the initial scan is hashing.
        let clip = fx.input.join("during-scan.mp4");
        fs::write(&clip, b"frames").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let cancel = CancellationToken::new();
        let monitor = fx.monitor.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { monitor.run_watch(stream, Vec::new(), token).await });

        let mut found = false;
        for _ in 0..50 {
            if fx.store.find_by_path(&clip).unwrap().is_some() {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        cancel.cancel();
        task.await.unwrap();
        assert!(found, "change made before the loop started was lost");
    }
}
