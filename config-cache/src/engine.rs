//! The engine owns the cache and everything that keeps it in line with the
//! durable store. Reads go straight to the cache; loading and the periodic
//! jobs run on a single background task driven by timers and [`Command`]s.
use crate::cache_item::{ReleaseVariant, cache_factory};
use crate::cache_table::{CacheError, CacheTable};
use crate::change_detector::{ChangeDetector, PassReport};
use crate::config::Config;
use crate::disk_cache::{DiskCache, DiskCacheError};
use crate::dump::dump_all::{BulkDumper, BulkReport, BulkScope};
use crate::dump::hook::dump_hook;
use crate::dump::processor::DumpProcessor;
use crate::dump::scheduler::{DumpScheduler, FatalHandler};
use crate::dump::{DumpError, DumpTask};
use crate::fingerprint::Fingerprints;
use crate::history::HistoryCleaner;
use crate::metrics_defs::{CACHE_KEYS, QUERY_RESOLVED};
use crate::query_chain::{ConfigQuery, QueryResolutionChain, QueryResult};
use crate::repository::{ConfigRepository, RepositoryError, TableSnapshot};
use crate::snapshot::SnapshotBridge;
use crate::types::{ConfigKey, KeyError, VariantTarget, now_millis};
use parking_lot::Mutex;
use shared::{counter, gauge};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("the config cache is not ready yet")]
    NotReady,

    #[error("invalid config key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("dump error: {0}")]
    Dump(#[from] DumpError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("local disk cache error: {0}")]
    Disk(#[from] DiskCacheError),

    #[error("unknown dump hook: {0}")]
    UnknownHook(String),

    #[error("unknown cache factory: {0}")]
    UnknownCacheFactory(String),

    #[error("the synchronizer has stopped")]
    ChannelClosed,
}

impl EngineError {
    fn is_fatal(&self) -> bool {
        match self {
            EngineError::Dump(e) => e.is_fatal(),
            EngineError::Cache(CacheError::DiskFull(_))
            | EngineError::Disk(DiskCacheError::DiskFull(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub enum Command {
    // Run a change detection pass outside of the normal interval.
    Refresh(oneshot::Sender<Result<PassReport, EngineError>>),
    // Dump every row of the durable store and prune cache entries without one.
    DumpAll(oneshot::Sender<Result<BulkReport, EngineError>>),
    // DumpAll after the durable store was replaced. Readiness comes back only
    // once it succeeds; a failure is retried after the dump retry delay.
    Rebuild(oneshot::Sender<Result<BulkReport, EngineError>>),
    // Stop the synchronizer and the dump workers.
    Shutdown,
}

/// Readiness as seen by the read path and the admin listener.
struct Status {
    ready: AtomicBool,
    // Set once the local disk filled up. Nothing clears it.
    failed: AtomicBool,
    // The durable store was replaced and the cache not yet rebuilt from it.
    rebuilding: AtomicBool,
    exit_on_disk_full: bool,
}

impl Status {
    fn new(exit_on_disk_full: bool) -> Self {
        Status {
            ready: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            rebuilding: AtomicBool::new(false),
            exit_on_disk_full,
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn set_ready(&self, ready: bool) {
        if ready && (self.failed.load(Ordering::Acquire) || self.rebuilding.load(Ordering::Acquire)) {
            return;
        }
        self.ready.store(ready, Ordering::Release);
    }

    fn begin_rebuild(&self) {
        self.rebuilding.store(true, Ordering::Release);
        self.ready.store(false, Ordering::Release);
    }

    fn finish_rebuild(&self) {
        self.rebuilding.store(false, Ordering::Release);
        self.set_ready(true);
    }

    fn fail(&self, error: &dyn std::error::Error) {
        self.failed.store(true, Ordering::Release);
        self.ready.store(false, Ordering::Release);
        tracing::error!(error = %error, "Local disk cache is full, config cache stops serving");
        if self.exit_on_disk_full {
            std::process::exit(1);
        }
    }
}

struct EngineInner {
    table: Arc<CacheTable>,
    chain: QueryResolutionChain,
    scheduler: DumpScheduler,
    status: Arc<Status>,
    snapshot_store: Arc<dyn TableSnapshot>,
    tx: mpsc::Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ConfigEngine {
    inner: Arc<EngineInner>,
}

impl ConfigEngine {
    /// Builds the engine and starts loading in the background. Must be called
    /// from within a tokio runtime. Reads fail with [`EngineError::NotReady`]
    /// until the first load completes.
    pub fn new<R>(config: &Config, repo: Arc<R>) -> Result<Self, EngineError>
    where
        R: ConfigRepository + TableSnapshot + 'static,
    {
        let hook = dump_hook(&config.dump.hook)
            .ok_or_else(|| EngineError::UnknownHook(config.dump.hook.clone()))?;
        let factory = cache_factory(&config.dump.cache_factory)
            .ok_or_else(|| EngineError::UnknownCacheFactory(config.dump.cache_factory.clone()))?;

        let disk = match config.local_cache.enabled {
            true => DiskCache::new(&config.local_cache.base_dir),
            false => DiskCache::disabled(),
        };
        let table = Arc::new(CacheTable::new(
            Arc::new(disk),
            factory,
            config.dump.lock_timeout(),
        ));
        let status = Arc::new(Status::new(config.dump.exit_on_disk_full));

        let store: Arc<dyn ConfigRepository> = repo.clone();
        let processor = Arc::new(DumpProcessor::new(store.clone(), table.clone(), hook));
        let on_fatal: FatalHandler = {
            let status = status.clone();
            Arc::new(move |e: &DumpError| status.fail(e))
        };
        let scheduler = DumpScheduler::new(processor.clone(), config.dump.retry_delay(), Some(on_fatal));
        scheduler.start(config.dump.workers);

        let synchronizer = Synchronizer {
            table: table.clone(),
            scheduler: scheduler.clone(),
            bulk: BulkDumper::new(
                store.clone(),
                processor,
                config.dump.page_size,
                config.dump.page_pause(),
            )
            .with_retry(scheduler.clone()),
            detector: ChangeDetector::new(
                store.clone(),
                table.clone(),
                scheduler.clone(),
                now_millis(),
                config.change_detection.page_size,
                config.change_detection.page_pause(),
            ),
            history: config.history.enabled.then(|| {
                HistoryCleaner::new(
                    store.clone(),
                    config.history.retention(),
                    config.history.batch_size,
                )
            }),
            status: status.clone(),
            quick_start_window: config.local_cache.quick_start_window(),
            bulk_interval: config.dump.bulk_interval(),
            detect_interval: config.change_detection.interval(),
            history_interval: config.history.interval(),
            rebuild_retry_delay: config.dump.retry_delay(),
        };

        // Channel to send commands to the synchronizer.
        let (tx, rx) = mpsc::channel::<Command>(64);

        // All loading happens from this task.
        let handle = tokio::spawn(synchronizer.run(rx));

        Ok(ConfigEngine {
            inner: Arc::new(EngineInner {
                chain: QueryResolutionChain::new(table.clone()),
                table,
                scheduler,
                status,
                snapshot_store: repo,
                tx,
                handle: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn resolve(&self, query: &ConfigQuery) -> Result<QueryResult, EngineError> {
        if !self.is_ready() {
            return Err(EngineError::NotReady);
        }
        query.key.validate()?;
        let result = self.inner.chain.resolve(query);
        counter!(QUERY_RESOLVED, "status" => result.status.as_str()).increment(1);
        Ok(result)
    }

    /// Called by the write path after a row was committed. The task is
    /// merged with any pending one for the same key and channel.
    pub fn on_write_committed(
        &self,
        key: ConfigKey,
        target: VariantTarget,
        last_modified: i64,
        source: &str,
    ) -> Result<(), EngineError> {
        key.validate()?;
        target.validate()?;
        tracing::debug!(key = %key, target = %target, last_modified, source, "Write committed");
        self.inner
            .scheduler
            .submit(DumpTask::dump(key, target, last_modified).with_source(source));
        Ok(())
    }

    pub async fn refresh(&self) -> Result<PassReport, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Refresh(reply)).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn dump_all(&self) -> Result<BulkReport, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::DumpAll(reply)).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Stops the background task and the dump workers. Reads keep working
    /// against whatever the cache holds.
    pub async fn shutdown(&self) {
        if self.send(Command::Shutdown).await.is_err() {
            tracing::debug!("Synchronizer already stopped");
        }
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Synchronizer task panicked");
        }
    }

    async fn send(&self, command: Command) -> Result<(), EngineError> {
        self.inner
            .tx
            .send(command)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.status.is_ready()
    }

    /// The local disk filled up. The engine never serves again.
    pub fn is_failed(&self) -> bool {
        self.inner.status.failed.load(Ordering::Acquire)
    }

    /// Stops serving and rebuilds the whole cache from the durable store.
    /// Used after the store's tables were replaced underneath the engine.
    /// An error is returned for the first attempt only; the engine keeps
    /// retrying and stays unready until one succeeds.
    pub(crate) async fn rebuild(&self) -> Result<BulkReport, EngineError> {
        self.inner.status.begin_rebuild();
        let (reply, rx) = oneshot::channel();
        self.send(Command::Rebuild(reply)).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub fn table(&self) -> &Arc<CacheTable> {
        &self.inner.table
    }

    pub fn scheduler(&self) -> &DumpScheduler {
        &self.inner.scheduler
    }

    pub fn snapshot_bridge(&self) -> SnapshotBridge {
        SnapshotBridge::new(self.inner.snapshot_store.clone(), self.clone())
    }
}

/// Loads the cache and runs the periodic jobs. Owned by the background task.
struct Synchronizer {
    table: Arc<CacheTable>,
    scheduler: DumpScheduler,
    bulk: BulkDumper,
    detector: ChangeDetector,
    history: Option<HistoryCleaner>,
    status: Arc<Status>,
    quick_start_window: Duration,
    bulk_interval: Duration,
    detect_interval: Duration,
    history_interval: Duration,
    rebuild_retry_delay: Duration,
}

impl Synchronizer {
    /// Performs the initial load, then runs the bulk dump, change detection
    /// and history sweep at their intervals until the Shutdown command is
    /// received. A failed initial load is retried on every detection tick.
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        let mut loaded = self.try_initial_load().await;

        let start = Instant::now();
        let mut bulk_tick = interval_at(start + self.bulk_interval, self.bulk_interval);
        let mut detect_tick = interval_at(start + self.detect_interval, self.detect_interval);
        let mut history_tick = interval_at(start + self.history_interval, self.history_interval);
        for tick in [&mut bulk_tick, &mut detect_tick, &mut history_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        // Set while a rebuild has failed and waits for its next attempt.
        let mut rebuild_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(rebuild_at.unwrap_or_else(Instant::now)), if rebuild_at.is_some() => {
                    let result = self.rebuild().await;
                    loaded |= result.is_ok();
                    rebuild_at = self.next_rebuild(&result);
                }
                _ = detect_tick.tick() => {
                    if !loaded {
                        loaded = self.try_initial_load().await;
                    } else if let Err(e) = self.detect().await {
                        tracing::warn!(error = %e, "Change detection pass failed");
                    }
                    gauge!(CACHE_KEYS).set(self.table.len() as f64);
                }
                _ = bulk_tick.tick(), if loaded => {
                    match self.bulk.dump_all(BulkScope::All, false).await {
                        Ok(_) => self.status.set_ready(true),
                        Err(e) => self.report(e.into(), "Periodic bulk dump failed"),
                    }
                }
                _ = history_tick.tick(), if self.history.is_some() => {
                    if let Some(history) = &self.history
                        && let Err(e) = history.sweep().await
                    {
                        tracing::warn!(error = %e, "History retention sweep failed");
                    }
                }
                cmd = rx.recv() => match cmd {
                    Some(Command::Refresh(reply)) => {
                        let result = match loaded {
                            true => self.detect().await,
                            false => Err(EngineError::NotReady),
                        };
                        let _ = reply.send(result);
                    }
                    Some(Command::DumpAll(reply)) => {
                        let result = self.dump_all().await;
                        loaded |= result.is_ok();
                        let _ = reply.send(result);
                    }
                    Some(Command::Rebuild(reply)) => {
                        let result = self.rebuild().await;
                        loaded |= result.is_ok();
                        rebuild_at = self.next_rebuild(&result);
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }

        self.scheduler.shutdown().await;
        tracing::info!("Config cache synchronizer stopped");
    }

    async fn try_initial_load(&self) -> bool {
        let started = std::time::Instant::now();
        match self.initial_load().await {
            Ok(()) => {
                tracing::info!(
                    keys = self.table.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Config cache ready"
                );
                true
            }
            Err(e) => {
                self.report(e, "Initial load failed, retrying at the next tick");
                false
            }
        }
    }

    /// Warm start when the heartbeat is recent enough: formal content comes
    /// from the local disk copy and only the other channels are read from the
    /// store, then changes since the heartbeat are replayed. Otherwise the
    /// disk copy is discarded and everything is dumped from the store.
    async fn initial_load(&self) -> Result<(), EngineError> {
        let disk = self.table.disk();
        let now = now_millis();
        let window = self.quick_start_window.as_millis() as i64;
        let heartbeat = disk
            .read_heartbeat()?
            .filter(|cursor| now - cursor.start_time < window);

        match heartbeat {
            Some(cursor) => {
                let entries = disk.load_formal()?;
                tracing::info!(
                    restored = entries.len(),
                    since = cursor.start_time,
                    "Quick start from local disk cache"
                );
                // File mtimes carry the row timestamps they were saved with.
                for entry in entries {
                    let fingerprints = Fingerprints::of(&entry.content);
                    let variant =
                        ReleaseVariant::new(&entry.content, fingerprints, None, entry.modified);
                    self.table.restore_formal(&entry.key, variant)?;
                }
                self.bulk.dump_all(BulkScope::ExceptFormal, false).await?;
                self.detector.reset(cursor.start_time);
                self.detector.run_pass().await?;
            }
            None => {
                tracing::info!("Cold start, dumping all configurations");
                disk.clear_all()?;
                self.bulk.dump_all(BulkScope::All, false).await?;
                self.detector.reset(now);
            }
        }

        disk.write_heartbeat(&self.detector.cursor())?;
        self.status.set_ready(true);
        Ok(())
    }

    async fn detect(&self) -> Result<PassReport, EngineError> {
        let report = self.detector.run_pass().await?;
        if let Err(e) = self.table.disk().write_heartbeat(&self.detector.cursor()) {
            self.report(e.into(), "Failed to write heartbeat");
        }
        Ok(report)
    }

    async fn dump_all(&self) -> Result<BulkReport, EngineError> {
        let started = now_millis();
        match self.bulk.dump_all(BulkScope::All, true).await {
            Ok(report) => {
                self.detector.reset(started);
                Ok(report)
            }
            Err(e) => {
                let e = EngineError::from(e);
                if e.is_fatal() {
                    self.status.fail(&e);
                }
                Err(e)
            }
        }
    }

    async fn rebuild(&self) -> Result<BulkReport, EngineError> {
        let report = self.dump_all().await?;
        self.status.finish_rebuild();
        tracing::info!(rows = report.rows, pruned = report.pruned, "Cache rebuilt");
        Ok(report)
    }

    fn next_rebuild(&self, result: &Result<BulkReport, EngineError>) -> Option<Instant> {
        match result {
            Err(e) if !e.is_fatal() => {
                tracing::warn!(
                    error = %e,
                    retry_in_ms = self.rebuild_retry_delay.as_millis() as u64,
                    "Cache rebuild failed, retrying"
                );
                Some(Instant::now() + self.rebuild_retry_delay)
            }
            _ => None,
        }
    }

    fn report(&self, e: EngineError, message: &'static str) {
        if e.is_fatal() {
            self.status.fail(&e);
        } else {
            tracing::warn!(error = %e, "{message}");
        }
    }
}
