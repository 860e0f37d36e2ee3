//! Periodic reconciliation against the durable store.
//!
//! Each pass looks at everything deleted or modified since the previous
//! pass started and schedules the dumps the cache is missing. It is the
//! safety net for write notifications that never arrived.
use crate::cache_table::CacheTable;
use crate::cursor::ChangeCursor;
use crate::dump::scheduler::DumpScheduler;
use crate::dump::{DumpTask, TaskKey};
use crate::metrics_defs::CHANGE_DETECTOR_PASS_DURATION;
use crate::repository::{ConfigRepository, RepositoryError};
use crate::types::{ConfigState, now_millis};
use indexmap::IndexMap;
use indexmap::map::Entry;
use parking_lot::Mutex;
use shared::histogram;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default, PartialEq)]
pub struct PassReport {
    pub deleted_scanned: usize,
    pub changed_scanned: usize,
    pub removes: usize,
    pub dumps: usize,
}

pub struct ChangeDetector {
    repo: Arc<dyn ConfigRepository>,
    table: Arc<CacheTable>,
    scheduler: DumpScheduler,
    page_size: usize,
    page_pause: Duration,
    cursor: Mutex<ChangeCursor>,
}

impl ChangeDetector {
    pub fn new(
        repo: Arc<dyn ConfigRepository>,
        table: Arc<CacheTable>,
        scheduler: DumpScheduler,
        start_time: i64,
        page_size: usize,
        page_pause: Duration,
    ) -> Self {
        ChangeDetector {
            repo,
            table,
            scheduler,
            page_size,
            page_pause,
            cursor: Mutex::new(ChangeCursor::at(start_time)),
        }
    }

    pub fn cursor(&self) -> ChangeCursor {
        self.cursor.lock().clone()
    }

    pub fn reset(&self, start_time: i64) {
        *self.cursor.lock() = ChangeCursor::at(start_time);
    }

    fn is_stale(&self, state: &ConfigState) -> bool {
        match self.table.variant_state(&state.key, &state.target) {
            None => true,
            Some(cached) => {
                state.last_modified > cached.last_modified
                    || state.md5.as_deref().is_some_and(|md5| md5 != cached.md5)
            }
        }
    }

    /// Runs one pass. The watermark only moves when the whole pass succeeds,
    /// so a failed pass is repeated from the same point.
    pub async fn run_pass(&self) -> Result<PassReport, RepositoryError> {
        let started = Instant::now();
        let pass_started = now_millis();
        let start_time = self.cursor.lock().start_time;
        let mut report = PassReport::default();
        let mut tasks: IndexMap<TaskKey, DumpTask> = IndexMap::new();

        let mut cursor = ChangeCursor::at(start_time);
        loop {
            let page = self
                .repo
                .find_deleted_since(start_time, cursor.page_start(), self.page_size)
                .await?;
            for deleted in &page {
                cursor.advance(deleted.id);
                report.deleted_scanned += 1;
                // Only trust the deletion if nothing was written back since.
                if self
                    .repo
                    .find_state(&deleted.key, &deleted.target)
                    .await?
                    .is_none()
                {
                    let task = DumpTask::remove(
                        deleted.key.clone(),
                        deleted.target.clone(),
                        deleted.last_modified,
                    );
                    tasks.insert(task.task_key(), task);
                }
            }
            if page.len() < self.page_size {
                break;
            }
            self.pause().await;
        }

        let mut cursor = ChangeCursor::at(start_time);
        loop {
            let page = self
                .repo
                .find_changed_since(start_time, cursor.page_start(), self.page_size)
                .await?;
            for state in &page {
                cursor.advance(state.id);
                report.changed_scanned += 1;
                if !self.is_stale(state) {
                    continue;
                }
                let task = DumpTask::dump(
                    state.key.clone(),
                    state.target.clone(),
                    state.last_modified,
                );
                match tasks.entry(task.task_key()) {
                    Entry::Occupied(mut existing) => {
                        if existing.get().is_remove
                            || existing.get().last_modified <= task.last_modified
                        {
                            existing.insert(task);
                        }
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(task);
                    }
                }
            }
            if page.len() < self.page_size {
                break;
            }
            self.pause().await;
        }

        for task in tasks.into_values() {
            if task.is_remove {
                report.removes += 1;
            } else {
                report.dumps += 1;
            }
            self.scheduler.submit(task.with_source("change-detector"));
        }

        *self.cursor.lock() = ChangeCursor::at(pass_started);
        histogram!(CHANGE_DETECTOR_PASS_DURATION).record(started.elapsed().as_secs_f64());
        if report.removes + report.dumps > 0 {
            tracing::info!(
                removes = report.removes,
                dumps = report.dumps,
                deleted_scanned = report.deleted_scanned,
                changed_scanned = report.changed_scanned,
                "Change detection pass scheduled dumps"
            );
        } else {
            tracing::debug!(changed_scanned = report.changed_scanned, "Change detection pass found nothing");
        }
        Ok(report)
    }

    async fn pause(&self) {
        if !self.page_pause.is_zero() {
            tokio::time::sleep(self.page_pause).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::processor::DumpProcessor;
    use crate::repository::{MemoryRepository, RowDraft};
    use crate::testutils::{test_key, test_processor};
    use crate::types::VariantTarget;

    fn detector(
        repo: &Arc<MemoryRepository>,
        processor: DumpProcessor,
        page_size: usize,
    ) -> (ChangeDetector, DumpScheduler) {
        let table = processor.table().clone();
        let scheduler = DumpScheduler::new(Arc::new(processor), Duration::from_millis(10), None);
        scheduler.start(2);
        let detector = ChangeDetector::new(
            repo.clone(),
            table,
            scheduler.clone(),
            0,
            page_size,
            Duration::ZERO,
        );
        (detector, scheduler)
    }

    #[tokio::test]
    async fn test_finds_changes_across_pages() {
        let (repo, processor) = test_processor();
        for i in 0..23 {
            repo.upsert(RowDraft::formal(test_key(&format!("d{i}")), format!("v{i}"), 100 + i));
        }
        let (detector, scheduler) = detector(&repo, processor, 5);

        let report = detector.run_pass().await.unwrap();
        assert_eq!(report.changed_scanned, 23);
        assert_eq!(report.dumps, 23);
        scheduler.wait_idle().await;

        let table = scheduler.processor().table();
        for i in 0..23 {
            assert_eq!(table.last_modified(&test_key(&format!("d{i}"))), 100 + i);
        }
        assert!(detector.cursor().start_time > 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_skips_up_to_date_rows() {
        let (repo, processor) = test_processor();
        repo.upsert(RowDraft::formal(test_key("a"), "v", 100));
        let (detector, scheduler) = detector(&repo, processor, 10);

        detector.run_pass().await.unwrap();
        scheduler.wait_idle().await;

        detector.reset(0);
        let report = detector.run_pass().await.unwrap();
        assert_eq!(report.changed_scanned, 1);
        assert_eq!(report.dumps, 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_confirms_deletions() {
        let (repo, processor) = test_processor();
        let gone = test_key("gone");
        let back = test_key("back");
        repo.upsert(RowDraft::formal(gone.clone(), "v", 100));
        repo.upsert(RowDraft::formal(back.clone(), "v", 100));
        let (detector, scheduler) = detector(&repo, processor, 10);
        detector.run_pass().await.unwrap();
        scheduler.wait_idle().await;

        repo.delete(&gone, &VariantTarget::Formal, 200);
        repo.delete(&back, &VariantTarget::Formal, 200);
        // Written again after the deletion: must not be removed.
        repo.upsert(RowDraft::formal(back.clone(), "v2", 201));

        detector.reset(150);
        let report = detector.run_pass().await.unwrap();
        assert_eq!(report.deleted_scanned, 2);
        assert_eq!(report.removes, 1);
        assert_eq!(report.dumps, 1);
        scheduler.wait_idle().await;

        let table = scheduler.processor().table();
        assert!(table.get(&gone).is_none());
        assert_eq!(table.last_modified(&back), 201);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_pass_keeps_watermark() {
        let (repo, processor) = test_processor();
        let (detector, scheduler) = detector(&repo, processor, 10);
        detector.reset(42);
        repo.fail_next(1);
        assert!(detector.run_pass().await.is_err());
        assert_eq!(detector.cursor(), ChangeCursor::at(42));
        scheduler.shutdown().await;
    }
}
