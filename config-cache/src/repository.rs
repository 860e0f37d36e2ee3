//! Access to the durable store the cache is derived from.
//!
//! The engine only reads through [`ConfigRepository`]; writers commit rows by
//! their own path and then notify the engine. [`MemoryRepository`] is the
//! store shipped with the binary and used throughout the tests.
use crate::fingerprint::md5_utf8;
use crate::types::{ConfigKey, ConfigRow, ConfigState, VariantTarget};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

pub const CONFIG_INFO: &str = "config_info";
pub const CONFIG_INFO_GRAY: &str = "config_info_gray";
pub const CONFIG_INFO_TAG: &str = "config_info_tag";
pub const CONFIG_INFO_BETA: &str = "config_info_beta";
pub const HIS_CONFIG_INFO: &str = "his_config_info";

pub const ALL_TABLES: &[&str] = &[
    CONFIG_INFO,
    CONFIG_INFO_GRAY,
    CONFIG_INFO_TAG,
    CONFIG_INFO_BETA,
    HIS_CONFIG_INFO,
];

#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    #[error("durable store unavailable: {0}")]
    Unavailable(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("table encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("table decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryOp {
    Insert,
    Update,
    Delete,
}

/// One entry of the change history. Deletions are only visible here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub id: u64,
    pub key: ConfigKey,
    pub target: VariantTarget,
    pub content: String,
    pub op: HistoryOp,
    pub last_modified: i64,
}

#[async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn find_row(
        &self,
        key: &ConfigKey,
        target: &VariantTarget,
    ) -> Result<Option<ConfigRow>, RepositoryError>;

    async fn find_state(
        &self,
        key: &ConfigKey,
        target: &VariantTarget,
    ) -> Result<Option<ConfigState>, RepositoryError>;

    /// Live rows modified at or after `start_time`, with id above `after_id`, in id order.
    async fn find_changed_since(
        &self,
        start_time: i64,
        after_id: u64,
        page_size: usize,
    ) -> Result<Vec<ConfigState>, RepositoryError>;

    /// Deletion records at or after `start_time`, with id above `after_id`, in id order.
    async fn find_deleted_since(
        &self,
        start_time: i64,
        after_id: u64,
        page_size: usize,
    ) -> Result<Vec<HistoryRow>, RepositoryError>;

    async fn count_rows(&self) -> Result<u64, RepositoryError>;

    async fn find_max_id(&self) -> Result<u64, RepositoryError>;

    /// Live rows with id above `after_id`, in id order.
    async fn page_rows(
        &self,
        after_id: u64,
        page_size: usize,
    ) -> Result<Vec<ConfigRow>, RepositoryError>;

    /// Deletes up to `limit` history records older than `cutoff`. Returns how many went.
    async fn remove_history_before(&self, cutoff: i64, limit: usize)
    -> Result<usize, RepositoryError>;
}

/// Flat export and import of whole tables, used by cluster snapshots.
pub trait TableSnapshot: Send + Sync {
    fn table_names(&self) -> Vec<&'static str> {
        ALL_TABLES.to_vec()
    }

    fn export_table(&self, name: &str) -> Result<Vec<u8>, RepositoryError>;

    /// Replaces the content of every named table at once.
    fn import_tables(&self, tables: Vec<(String, Vec<u8>)>) -> Result<(), RepositoryError>;
}

/// Commits writes to the durable store. The caller notifies the engine
/// once the write is visible to readers.
#[async_trait]
pub trait ConfigWriter: Send + Sync {
    async fn publish(&self, draft: RowDraft) -> Result<ConfigRow, RepositoryError>;

    /// Returns `false` when there was nothing to delete.
    async fn remove(
        &self,
        key: &ConfigKey,
        target: &VariantTarget,
        at: i64,
    ) -> Result<bool, RepositoryError>;
}

/// A row to be written. The store assigns the id and the fingerprint.
#[derive(Clone, Debug, Default)]
pub struct RowDraft {
    pub key: ConfigKey,
    pub target: Option<VariantTarget>,
    pub content: String,
    pub encrypted_data_key: Option<String>,
    pub gray_rule: Option<String>,
    pub beta_ips: Option<String>,
    pub last_modified: i64,
}

impl RowDraft {
    pub fn formal(key: ConfigKey, content: impl Into<String>, last_modified: i64) -> Self {
        RowDraft {
            key,
            target: Some(VariantTarget::Formal),
            content: content.into(),
            last_modified,
            ..Default::default()
        }
    }

    pub fn gray(
        key: ConfigKey,
        gray_name: &str,
        content: impl Into<String>,
        rule: impl Into<String>,
        last_modified: i64,
    ) -> Self {
        RowDraft {
            key,
            target: Some(VariantTarget::Gray(gray_name.to_string())),
            content: content.into(),
            gray_rule: Some(rule.into()),
            last_modified,
            ..Default::default()
        }
    }

    pub fn tag(key: ConfigKey, tag: &str, content: impl Into<String>, last_modified: i64) -> Self {
        RowDraft {
            key,
            target: Some(VariantTarget::Tag(tag.to_string())),
            content: content.into(),
            last_modified,
            ..Default::default()
        }
    }

    pub fn beta(
        key: ConfigKey,
        content: impl Into<String>,
        ips: impl Into<String>,
        last_modified: i64,
    ) -> Self {
        RowDraft {
            key,
            target: Some(VariantTarget::Beta),
            content: content.into(),
            beta_ips: Some(ips.into()),
            last_modified,
            ..Default::default()
        }
    }
}

fn table_of(target: &VariantTarget) -> &'static str {
    match target {
        VariantTarget::Formal => CONFIG_INFO,
        VariantTarget::Gray(_) => CONFIG_INFO_GRAY,
        VariantTarget::Tag(_) => CONFIG_INFO_TAG,
        VariantTarget::Beta => CONFIG_INFO_BETA,
    }
}

#[derive(Default)]
struct Tables {
    last_id: u64,
    rows: BTreeMap<u64, ConfigRow>,
    index: HashMap<(ConfigKey, VariantTarget), u64>,
    history: BTreeMap<u64, HistoryRow>,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    fn record(&mut self, row: &ConfigRow, op: HistoryOp, at: i64) {
        let id = self.next_id();
        self.history.insert(
            id,
            HistoryRow {
                id,
                key: row.key.clone(),
                target: row.target.clone(),
                content: row.content.clone(),
                op,
                last_modified: at,
            },
        );
    }

    fn delete(&mut self, key: &ConfigKey, target: &VariantTarget, at: i64) -> bool {
        let Some(id) = self.index.remove(&(key.clone(), target.clone())) else {
            return false;
        };
        if let Some(row) = self.rows.remove(&id) {
            self.record(&row, HistoryOp::Delete, at);
        }
        true
    }
}

#[derive(Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
    fail_next: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `calls` repository reads fail as if the store were down.
    pub fn fail_next(&self, calls: usize) {
        self.fail_next.store(calls, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(RepositoryError::Unavailable("injected failure".into())),
            Err(_) => Ok(()),
        }
    }

    /// Inserts or updates the row for the draft's key and channel.
    pub fn upsert(&self, draft: RowDraft) -> ConfigRow {
        let target = draft.target.unwrap_or(VariantTarget::Formal);
        let mut tables = self.tables.write();
        let existing = tables.index.get(&(draft.key.clone(), target.clone())).copied();
        let id = match existing {
            Some(id) => id,
            None => tables.next_id(),
        };
        let row = ConfigRow {
            id,
            md5: Some(md5_utf8(&draft.content)),
            key: draft.key,
            target,
            content: draft.content,
            encrypted_data_key: draft.encrypted_data_key,
            last_modified: draft.last_modified,
            gray_rule: draft.gray_rule,
            beta_ips: draft.beta_ips,
        };
        let op = if existing.is_some() {
            HistoryOp::Update
        } else {
            HistoryOp::Insert
        };
        tables.record(&row, op, row.last_modified);
        tables
            .index
            .insert((row.key.clone(), row.target.clone()), id);
        tables.rows.insert(id, row.clone());
        row
    }

    /// Inserts a fully formed row. A row already present under the same id
    /// or channel is left alone and `false` is returned.
    pub fn insert(&self, row: ConfigRow) -> bool {
        let mut tables = self.tables.write();
        let index_key = (row.key.clone(), row.target.clone());
        if tables.rows.contains_key(&row.id) || tables.index.contains_key(&index_key) {
            return false;
        }
        tables.last_id = tables.last_id.max(row.id);
        tables.index.insert(index_key, row.id);
        tables.rows.insert(row.id, row);
        true
    }

    /// Deletes one channel of a key. Deleting the formal release deletes
    /// every channel of the key with it.
    pub fn delete(&self, key: &ConfigKey, target: &VariantTarget, at: i64) -> bool {
        let mut tables = self.tables.write();
        if !target.is_formal() {
            return tables.delete(key, target, at);
        }
        let targets: Vec<VariantTarget> = tables
            .index
            .keys()
            .filter(|(k, _)| k == key)
            .map(|(_, t)| t.clone())
            .collect();
        let mut deleted = false;
        for t in targets {
            deleted |= tables.delete(key, &t, at);
        }
        deleted
    }

    pub fn history_len(&self) -> usize {
        self.tables.read().history.len()
    }
}

#[async_trait]
impl ConfigRepository for MemoryRepository {
    async fn find_row(
        &self,
        key: &ConfigKey,
        target: &VariantTarget,
    ) -> Result<Option<ConfigRow>, RepositoryError> {
        self.check_available()?;
        let tables = self.tables.read();
        Ok(tables
            .index
            .get(&(key.clone(), target.clone()))
            .and_then(|id| tables.rows.get(id))
            .cloned())
    }

    async fn find_state(
        &self,
        key: &ConfigKey,
        target: &VariantTarget,
    ) -> Result<Option<ConfigState>, RepositoryError> {
        Ok(self.find_row(key, target).await?.as_ref().map(ConfigState::from))
    }

    async fn find_changed_since(
        &self,
        start_time: i64,
        after_id: u64,
        page_size: usize,
    ) -> Result<Vec<ConfigState>, RepositoryError> {
        self.check_available()?;
        let tables = self.tables.read();
        Ok(tables
            .rows
            .range(after_id.saturating_add(1)..)
            .map(|(_, row)| row)
            .filter(|row| row.last_modified >= start_time)
            .take(page_size)
            .map(ConfigState::from)
            .collect())
    }

    async fn find_deleted_since(
        &self,
        start_time: i64,
        after_id: u64,
        page_size: usize,
    ) -> Result<Vec<HistoryRow>, RepositoryError> {
        self.check_available()?;
        let tables = self.tables.read();
        Ok(tables
            .history
            .range(after_id.saturating_add(1)..)
            .map(|(_, row)| row)
            .filter(|row| row.op == HistoryOp::Delete && row.last_modified >= start_time)
            .take(page_size)
            .cloned()
            .collect())
    }

    async fn count_rows(&self) -> Result<u64, RepositoryError> {
        self.check_available()?;
        Ok(self.tables.read().rows.len() as u64)
    }

    async fn find_max_id(&self) -> Result<u64, RepositoryError> {
        self.check_available()?;
        Ok(self
            .tables
            .read()
            .rows
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    async fn page_rows(
        &self,
        after_id: u64,
        page_size: usize,
    ) -> Result<Vec<ConfigRow>, RepositoryError> {
        self.check_available()?;
        let tables = self.tables.read();
        Ok(tables
            .rows
            .range(after_id.saturating_add(1)..)
            .take(page_size)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn remove_history_before(
        &self,
        cutoff: i64,
        limit: usize,
    ) -> Result<usize, RepositoryError> {
        self.check_available()?;
        let mut tables = self.tables.write();
        let expired: Vec<u64> = tables
            .history
            .values()
            .filter(|row| row.last_modified < cutoff)
            .take(limit)
            .map(|row| row.id)
            .collect();
        for id in &expired {
            tables.history.remove(id);
        }
        Ok(expired.len())
    }
}

#[async_trait]
impl ConfigWriter for MemoryRepository {
    async fn publish(&self, draft: RowDraft) -> Result<ConfigRow, RepositoryError> {
        Ok(self.upsert(draft))
    }

    async fn remove(
        &self,
        key: &ConfigKey,
        target: &VariantTarget,
        at: i64,
    ) -> Result<bool, RepositoryError> {
        Ok(self.delete(key, target, at))
    }
}

fn codec() -> bincode::config::Configuration {
    bincode::config::standard()
}

impl TableSnapshot for MemoryRepository {
    fn export_table(&self, name: &str) -> Result<Vec<u8>, RepositoryError> {
        let tables = self.tables.read();
        if name == HIS_CONFIG_INFO {
            let rows: Vec<&HistoryRow> = tables.history.values().collect();
            return Ok(bincode::serde::encode_to_vec(&rows, codec())?);
        }
        if !ALL_TABLES.contains(&name) {
            return Err(RepositoryError::UnknownTable(name.to_string()));
        }
        let rows: Vec<&ConfigRow> = tables
            .rows
            .values()
            .filter(|row| table_of(&row.target) == name)
            .collect();
        Ok(bincode::serde::encode_to_vec(&rows, codec())?)
    }

    fn import_tables(&self, exports: Vec<(String, Vec<u8>)>) -> Result<(), RepositoryError> {
        // Decode everything before touching the live tables.
        let mut imported = Tables::default();
        for (name, bytes) in exports {
            if name == HIS_CONFIG_INFO {
                let (rows, _): (Vec<HistoryRow>, usize) =
                    bincode::serde::decode_from_slice(&bytes, codec())?;
                for row in rows {
                    imported.last_id = imported.last_id.max(row.id);
                    imported.history.insert(row.id, row);
                }
                continue;
            }
            if !ALL_TABLES.contains(&name.as_str()) {
                return Err(RepositoryError::UnknownTable(name));
            }
            let (rows, _): (Vec<ConfigRow>, usize) =
                bincode::serde::decode_from_slice(&bytes, codec())?;
            for row in rows {
                imported.last_id = imported.last_id.max(row.id);
                imported
                    .index
                    .insert((row.key.clone(), row.target.clone()), row.id);
                imported.rows.insert(row.id, row);
            }
        }
        *self.tables.write() = imported;
        Ok(())
    }
}
