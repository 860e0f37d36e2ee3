use crate::cache_item::ReleaseVariant;
use crate::cache_table::{CacheTable, DumpOutcome};
use crate::dump::hook::DumpHook;
use crate::dump::{DumpError, DumpTask, TaskKey};
use crate::metrics_defs::DUMP_TASK_APPLIED;
use crate::repository::ConfigRepository;
use crate::types::{ConfigKey, ConfigRow, VariantTarget};
use shared::counter;
use std::sync::Arc;

/// Applies a single task: reads the authoritative row and brings the cache
/// entry for that key and channel in line with it.
pub struct DumpProcessor {
    repo: Arc<dyn ConfigRepository>,
    table: Arc<CacheTable>,
    hook: Arc<dyn DumpHook>,
}

impl DumpProcessor {
    pub fn new(
        repo: Arc<dyn ConfigRepository>,
        table: Arc<CacheTable>,
        hook: Arc<dyn DumpHook>,
    ) -> Self {
        DumpProcessor { repo, table, hook }
    }

    pub fn table(&self) -> &Arc<CacheTable> {
        &self.table
    }

    pub async fn process(&self, task: &DumpTask) -> Result<DumpOutcome, DumpError> {
        let outcome = if task.is_remove {
            self.remove(&task.key, &task.target)?
        } else {
            match self.repo.find_row(&task.key, &task.target).await? {
                Some(row) => self.apply(&row)?,
                // The row went away between the event and now.
                None => self.remove(&task.key, &task.target)?,
            }
        };

        if task.is_remove || outcome == DumpOutcome::Removed {
            tracing::info!(
                key = %task.key,
                target = %task.target,
                source = task.source.as_deref().unwrap_or("-"),
                outcome = outcome.as_str(),
                "Configuration removed from cache"
            );
        }
        counter!(DUMP_TASK_APPLIED, "outcome" => outcome.as_str()).increment(1);
        self.hook.after_dump(task, outcome);
        Ok(outcome)
    }

    /// Writes one row into the cache without consulting the store.
    pub fn apply(&self, row: &ConfigRow) -> Result<DumpOutcome, DumpError> {
        let fingerprints = self.hook.before_dump(row);
        let variant = ReleaseVariant::new(
            &row.content,
            fingerprints,
            row.encrypted_data_key.clone(),
            row.last_modified,
        );

        let outcome = match &row.target {
            VariantTarget::Formal => self.table.dump(&row.key, variant)?,
            VariantTarget::Gray(name) => {
                let rule = row.gray_rule.as_deref().ok_or_else(|| {
                    DumpError::InvalidRow(task_key(row), "gray row without a rule")
                })?;
                self.table.dump_gray(&row.key, name, variant, rule)?
            }
            VariantTarget::Tag(tag) => self.table.dump_tag(&row.key, tag, variant)?,
            VariantTarget::Beta => {
                let ips = row.beta_ips.as_deref().ok_or_else(|| {
                    DumpError::InvalidRow(task_key(row), "beta row without an address list")
                })?;
                self.table.dump_beta(&row.key, variant, ips)?
            }
        };

        match outcome {
            DumpOutcome::Updated => {
                tracing::info!(
                    key = %row.key,
                    target = %row.target,
                    last_modified = row.last_modified,
                    md5 = row.md5.as_deref().unwrap_or("-"),
                    "Configuration dumped"
                );
            }
            _ => {
                tracing::debug!(
                    key = %row.key,
                    target = %row.target,
                    outcome = outcome.as_str(),
                    "Configuration dump skipped"
                );
            }
        }
        Ok(outcome)
    }

    pub fn remove(&self, key: &ConfigKey, target: &VariantTarget) -> Result<DumpOutcome, DumpError> {
        let outcome = match target {
            VariantTarget::Formal => self.table.remove(key)?,
            VariantTarget::Gray(name) => self.table.remove_gray(key, name)?,
            VariantTarget::Tag(tag) => self.table.remove_tag(key, tag)?,
            VariantTarget::Beta => self.table.remove_beta(key)?,
        };
        Ok(outcome)
    }
}

fn task_key(row: &ConfigRow) -> TaskKey {
    TaskKey {
        key: row.key.clone(),
        target: row.target.clone(),
    }
}
