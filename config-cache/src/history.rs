use crate::metrics_defs::HISTORY_ROWS_REMOVED;
use crate::repository::{ConfigRepository, RepositoryError};
use crate::types::now_millis;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;

/// Deletes change history older than the retention period, in batches.
pub struct HistoryCleaner {
    repo: Arc<dyn ConfigRepository>,
    retention: Duration,
    batch_size: usize,
}

impl HistoryCleaner {
    pub fn new(repo: Arc<dyn ConfigRepository>, retention: Duration, batch_size: usize) -> Self {
        HistoryCleaner {
            repo,
            retention,
            batch_size,
        }
    }

    pub async fn sweep(&self) -> Result<usize, RepositoryError> {
        self.sweep_before(now_millis() - self.retention.as_millis() as i64)
            .await
    }

    pub async fn sweep_before(&self, cutoff: i64) -> Result<usize, RepositoryError> {
        let mut total = 0;
        loop {
            let removed = self
                .repo
                .remove_history_before(cutoff, self.batch_size)
                .await?;
            total += removed;
            if removed < self.batch_size {
                break;
            }
        }
        counter!(HISTORY_ROWS_REMOVED).increment(total as u64);
        if total > 0 {
            tracing::info!(removed = total, cutoff, "Removed expired configuration history");
        }
        Ok(total)
    }
}
