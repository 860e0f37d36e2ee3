use crate::cache_table::DumpOutcome;
use crate::dump::processor::DumpProcessor;
use crate::dump::scheduler::DumpScheduler;
use crate::dump::{DumpError, DumpTask};
use crate::metrics_defs::DUMP_BULK_ROWS;
use crate::repository::ConfigRepository;
use crate::types::{ConfigKey, VariantTarget};
use shared::histogram;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Which channels a bulk dump applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BulkScope {
    All,
    /// Gray, tag and beta only. Used on a warm start, where formal content
    /// was already restored from the local disk.
    ExceptFormal,
}

impl BulkScope {
    fn includes(&self, target: &VariantTarget) -> bool {
        match self {
            BulkScope::All => true,
            BulkScope::ExceptFormal => !target.is_formal(),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct BulkReport {
    pub rows: u64,
    pub updated: u64,
    pub failed: u64,
    pub pruned: u64,
}

/// Walks the whole durable store in id order and applies every row.
pub struct BulkDumper {
    repo: Arc<dyn ConfigRepository>,
    processor: Arc<DumpProcessor>,
    retry: Option<DumpScheduler>,
    page_size: usize,
    page_pause: Duration,
}

impl BulkDumper {
    pub fn new(
        repo: Arc<dyn ConfigRepository>,
        processor: Arc<DumpProcessor>,
        page_size: usize,
        page_pause: Duration,
    ) -> Self {
        BulkDumper {
            repo,
            processor,
            retry: None,
            page_size,
            page_pause,
        }
    }

    /// Rows that fail transiently are handed to the scheduler instead of
    /// being skipped until the next bulk dump.
    pub fn with_retry(mut self, scheduler: DumpScheduler) -> Self {
        self.retry = Some(scheduler);
        self
    }

    /// With `prune`, cache entries with no live row are removed afterwards.
    pub async fn dump_all(&self, scope: BulkScope, prune: bool) -> Result<BulkReport, DumpError> {
        let mut report = BulkReport::default();
        let mut seen: HashSet<(ConfigKey, VariantTarget)> = HashSet::new();
        let max_id = self.repo.find_max_id().await?;
        let mut last_id = 0u64;

        tracing::info!(max_id, ?scope, "Starting bulk dump");

        while last_id < max_id {
            let page = self.repo.page_rows(last_id, self.page_size).await?;
            let Some(last) = page.last() else {
                last_id += self.page_size as u64;
                continue;
            };
            last_id = last.id;

            for row in &page {
                report.rows += 1;
                if prune {
                    seen.insert((row.key.clone(), row.target.clone()));
                }
                if !scope.includes(&row.target) {
                    continue;
                }
                match self.processor.apply(row) {
                    Ok(DumpOutcome::Updated) => report.updated += 1,
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(key = %row.key, target = %row.target, error = %e, "Bulk dump of row failed");
                        if let Some(scheduler) = &self.retry
                            && e.is_retryable()
                        {
                            scheduler.submit(DumpTask::dump(
                                row.key.clone(),
                                row.target.clone(),
                                row.last_modified,
                            ));
                        }
                    }
                }
            }

            if !self.page_pause.is_zero() {
                tokio::time::sleep(self.page_pause).await;
            }
        }

        if prune {
            report.pruned = self.prune(scope, &seen)?;
        }

        histogram!(DUMP_BULK_ROWS).record(report.rows as f64);
        tracing::info!(
            rows = report.rows,
            updated = report.updated,
            failed = report.failed,
            pruned = report.pruned,
            "Bulk dump finished"
        );
        Ok(report)
    }

    fn prune(
        &self,
        scope: BulkScope,
        seen: &HashSet<(ConfigKey, VariantTarget)>,
    ) -> Result<u64, DumpError> {
        let table = self.processor.table();
        let mut pruned = 0;
        for key in table.keys() {
            let Some(item) = table.get(&key) else {
                continue;
            };
            let stale: Vec<VariantTarget> = {
                let store = item.read();
                let mut targets = Vec::new();
                if store.formal().is_populated() {
                    targets.push(VariantTarget::Formal);
                }
                targets.extend(
                    store
                        .sorted_grays()
                        .iter()
                        .map(|gray| VariantTarget::Gray(gray.gray_name.clone())),
                );
                targets.extend(store.tag_names().into_iter().map(VariantTarget::Tag));
                if store.beta().is_some() {
                    targets.push(VariantTarget::Beta);
                }
                targets
                    .into_iter()
                    .filter(|target| scope.includes(target))
                    .filter(|target| !seen.contains(&(key.clone(), target.clone())))
                    .collect()
            };
            for target in stale {
                if self.processor.remove(&key, &target)? == DumpOutcome::Removed {
                    pruned += 1;
                }
                if target.is_formal() {
                    break;
                }
            }
        }
        Ok(pruned)
    }
}
