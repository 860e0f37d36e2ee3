//! The in-memory table of released configurations.
//!
//! Each key owns a [`CacheItem`]. Every operation clones the item out of the
//! map before locking it, so the map shard is never held while waiting on a
//! key lock and unrelated keys never contend.
//!
//! All `dump*` operations share one rule:
//! 1. an incoming timestamp older than the cached one is ignored;
//! 2. a changed fingerprint (or rule / address list) writes the local disk
//!    copy and then replaces the cached variant;
//! 3. an equal fingerprint with a newer timestamp only moves the timestamp;
//! 4. anything else leaves the entry untouched.
use crate::cache_item::{BetaVariant, CacheFactory, CacheItem, ReleaseVariant, ReleaseVariantStore};
use crate::disk_cache::{DiskCache, DiskCacheError};
use crate::fingerprint::Fingerprints;
use crate::gray_rule::{GrayRule, GrayRuleError};
use crate::types::{ConfigKey, NULL_FINGERPRINT, NULL_TIMESTAMP, VariantTarget};
use dashmap::DashMap;
use parking_lot::RwLockWriteGuard;
use std::io;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("timed out waiting for the write lock of {0}")]
    LockTimeout(ConfigKey),

    #[error("local disk is full: {0}")]
    DiskFull(io::Error),

    #[error("local disk cache error: {0}")]
    Disk(DiskCacheError),

    #[error("invalid gray rule: {0}")]
    InvalidRule(#[from] GrayRuleError),
}

impl CacheError {
    /// Errors worth retrying later with the same input.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::LockTimeout(_) => true,
            CacheError::Disk(DiskCacheError::UnsafePath(_)) => false,
            CacheError::Disk(_) => true,
            CacheError::DiskFull(_) | CacheError::InvalidRule(_) => false,
        }
    }
}

impl From<DiskCacheError> for CacheError {
    fn from(err: DiskCacheError) -> Self {
        match err {
            DiskCacheError::DiskFull(e) => CacheError::DiskFull(e),
            other => CacheError::Disk(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DumpOutcome {
    Updated,
    TimestampUpdated,
    Unchanged,
    Outdated,
    Removed,
    NotFound,
}

impl DumpOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DumpOutcome::Updated => "updated",
            DumpOutcome::TimestampUpdated => "timestamp_updated",
            DumpOutcome::Unchanged => "unchanged",
            DumpOutcome::Outdated => "outdated",
            DumpOutcome::Removed => "removed",
            DumpOutcome::NotFound => "not_found",
        }
    }
}

/// Timestamp and UTF-8 fingerprint of one cached variant.
#[derive(Clone, Debug, PartialEq)]
pub struct VariantState {
    pub last_modified: i64,
    pub md5: String,
}

enum Change {
    Outdated,
    Replace,
    Touch,
    Unchanged,
}

fn classify(current: Option<(i64, &str)>, incoming: &ReleaseVariant, extra_changed: bool) -> Change {
    let Some((ts, md5)) = current else {
        return Change::Replace;
    };
    if incoming.last_modified < ts {
        Change::Outdated
    } else if md5 != incoming.fingerprints.utf8 || extra_changed {
        Change::Replace
    } else if incoming.last_modified > ts {
        Change::Touch
    } else {
        Change::Unchanged
    }
}

pub struct CacheTable {
    items: DashMap<ConfigKey, Arc<CacheItem>>,
    disk: Arc<DiskCache>,
    factory: Arc<dyn CacheFactory>,
    lock_timeout: Duration,
}

impl CacheTable {
    pub fn new(disk: Arc<DiskCache>, factory: Arc<dyn CacheFactory>, lock_timeout: Duration) -> Self {
        CacheTable {
            items: DashMap::new(),
            disk,
            factory,
            lock_timeout,
        }
    }

    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }

    pub fn get(&self, key: &ConfigKey) -> Option<Arc<CacheItem>> {
        self.items.get(key).map(|item| item.value().clone())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn keys(&self) -> Vec<ConfigKey> {
        self.items.iter().map(|entry| entry.key().clone()).collect()
    }

    fn make_sure(&self, key: &ConfigKey) -> Arc<CacheItem> {
        if let Some(item) = self.get(key) {
            return item;
        }
        self.items
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CacheItem::new(key.clone(), self.factory.clone())))
            .value()
            .clone()
    }

    fn write_store<'a>(
        &self,
        item: &'a CacheItem,
    ) -> Result<RwLockWriteGuard<'a, ReleaseVariantStore>, CacheError> {
        item.store()
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| CacheError::LockTimeout(item.key().clone()))
    }

    /// Runs `f` with the key's dump guard held on an item that is still in
    /// the table. Retries if the item was removed while waiting on the guard.
    fn with_dump_guard<T>(
        &self,
        key: &ConfigKey,
        f: impl Fn(&CacheItem) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        loop {
            let item = self.make_sure(key);
            let _guard = item.dump_guard.lock();
            if item.is_detached() {
                continue;
            }
            return f(&item);
        }
    }

    pub fn dump(&self, key: &ConfigKey, variant: ReleaseVariant) -> Result<DumpOutcome, CacheError> {
        self.with_dump_guard(key, |item| {
            let change = {
                let store = item.read();
                let formal = store.formal();
                classify(
                    Some((formal.last_modified, formal.fingerprints.utf8.as_str())),
                    &variant,
                    false,
                )
            };
            match change {
                Change::Outdated => Ok(DumpOutcome::Outdated),
                Change::Unchanged => Ok(DumpOutcome::Unchanged),
                Change::Touch => {
                    self.write_store(item)?.touch_formal(variant.last_modified);
                    Ok(DumpOutcome::TimestampUpdated)
                }
                Change::Replace => {
                    self.disk.save(
                        key,
                        &VariantTarget::Formal,
                        &variant.content,
                        variant.last_modified,
                    )?;
                    self.write_store(item)?.set_formal(variant.clone());
                    Ok(DumpOutcome::Updated)
                }
            }
        })
    }

    /// Loads a formal variant read back from the local disk copy. Only the
    /// memory entry is written.
    pub fn restore_formal(&self, key: &ConfigKey, variant: ReleaseVariant) -> Result<(), CacheError> {
        self.with_dump_guard(key, |item| {
            self.write_store(item)?.set_formal(variant.clone());
            Ok(())
        })
    }

    pub fn dump_gray(
        &self,
        key: &ConfigKey,
        gray_name: &str,
        variant: ReleaseVariant,
        raw_rule: &str,
    ) -> Result<DumpOutcome, CacheError> {
        self.with_dump_guard(key, |item| {
            let change = {
                let store = item.read();
                let current = store.gray(gray_name);
                let rule_changed = current.is_some_and(|gray| gray.rule.raw() != raw_rule);
                classify(
                    current.map(|gray| {
                        (gray.variant.last_modified, gray.variant.fingerprints.utf8.as_str())
                    }),
                    &variant,
                    rule_changed,
                )
            };
            match change {
                Change::Outdated => Ok(DumpOutcome::Outdated),
                Change::Unchanged => Ok(DumpOutcome::Unchanged),
                Change::Touch => {
                    self.write_store(item)?
                        .touch_gray(gray_name, variant.last_modified);
                    Ok(DumpOutcome::TimestampUpdated)
                }
                Change::Replace => {
                    let rule = GrayRule::parse(raw_rule)?;
                    let target = VariantTarget::Gray(gray_name.to_string());
                    self.disk
                        .save(key, &target, &variant.content, variant.last_modified)?;
                    self.write_store(item)?
                        .insert_gray(gray_name, variant.clone(), rule);
                    Ok(DumpOutcome::Updated)
                }
            }
        })
    }

    pub fn dump_tag(
        &self,
        key: &ConfigKey,
        tag: &str,
        variant: ReleaseVariant,
    ) -> Result<DumpOutcome, CacheError> {
        self.with_dump_guard(key, |item| {
            let change = {
                let store = item.read();
                classify(
                    store
                        .tag(tag)
                        .map(|v| (v.last_modified, v.fingerprints.utf8.as_str())),
                    &variant,
                    false,
                )
            };
            match change {
                Change::Outdated => Ok(DumpOutcome::Outdated),
                Change::Unchanged => Ok(DumpOutcome::Unchanged),
                Change::Touch => {
                    self.write_store(item)?.touch_tag(tag, variant.last_modified);
                    Ok(DumpOutcome::TimestampUpdated)
                }
                Change::Replace => {
                    self.disk
                        .save(
                            key,
                            &VariantTarget::Tag(tag.to_string()),
                            &variant.content,
                            variant.last_modified,
                        )?;
                    self.write_store(item)?.set_tag(tag, variant.clone());
                    Ok(DumpOutcome::Updated)
                }
            }
        })
    }

    pub fn dump_beta(
        &self,
        key: &ConfigKey,
        variant: ReleaseVariant,
        ips: &str,
    ) -> Result<DumpOutcome, CacheError> {
        self.with_dump_guard(key, |item| {
            let change = {
                let store = item.read();
                let current = store.beta();
                let ips_changed = current.is_some_and(|beta| beta.raw_ips != ips);
                classify(
                    current.map(|beta| {
                        (beta.variant.last_modified, beta.variant.fingerprints.utf8.as_str())
                    }),
                    &variant,
                    ips_changed,
                )
            };
            match change {
                Change::Outdated => Ok(DumpOutcome::Outdated),
                Change::Unchanged => Ok(DumpOutcome::Unchanged),
                Change::Touch => {
                    self.write_store(item)?.touch_beta(variant.last_modified);
                    Ok(DumpOutcome::TimestampUpdated)
                }
                Change::Replace => {
                    self.disk.save(
                        key,
                        &VariantTarget::Beta,
                        &variant.content,
                        variant.last_modified,
                    )?;
                    self.write_store(item)?
                        .set_beta(BetaVariant::new(variant.clone(), ips));
                    Ok(DumpOutcome::Updated)
                }
            }
        })
    }

    /// Removes the key with every channel it carries.
    pub fn remove(&self, key: &ConfigKey) -> Result<DumpOutcome, CacheError> {
        let Some(item) = self.get(key) else {
            return Ok(DumpOutcome::NotFound);
        };
        let _guard = item.dump_guard.lock();
        if item.is_detached() {
            return Ok(DumpOutcome::NotFound);
        }
        self.disk.remove_all(key)?;
        self.items
            .remove_if(key, |_, current| Arc::ptr_eq(current, &item));
        item.detach();
        Ok(DumpOutcome::Removed)
    }

    fn remove_channel(
        &self,
        key: &ConfigKey,
        target: VariantTarget,
        f: impl FnOnce(&mut ReleaseVariantStore) -> bool,
    ) -> Result<DumpOutcome, CacheError> {
        let Some(item) = self.get(key) else {
            return Ok(DumpOutcome::NotFound);
        };
        let _guard = item.dump_guard.lock();
        if item.is_detached() {
            return Ok(DumpOutcome::NotFound);
        }
        self.disk.remove(key, &target)?;
        if f(&mut *self.write_store(&item)?) {
            Ok(DumpOutcome::Removed)
        } else {
            Ok(DumpOutcome::NotFound)
        }
    }

    pub fn remove_gray(&self, key: &ConfigKey, gray_name: &str) -> Result<DumpOutcome, CacheError> {
        self.remove_channel(key, VariantTarget::Gray(gray_name.to_string()), |store| {
            store.remove_gray(gray_name)
        })
    }

    pub fn remove_tag(&self, key: &ConfigKey, tag: &str) -> Result<DumpOutcome, CacheError> {
        self.remove_channel(key, VariantTarget::Tag(tag.to_string()), |store| {
            store.remove_tag(tag)
        })
    }

    pub fn remove_beta(&self, key: &ConfigKey) -> Result<DumpOutcome, CacheError> {
        self.remove_channel(key, VariantTarget::Beta, |store| store.remove_beta())
    }

    /// UTF-8 fingerprint of the formal variant, `"null"` when absent.
    pub fn content_fingerprint(&self, key: &ConfigKey) -> String {
        self.get(key)
            .map(|item| item.read().formal().fingerprints.utf8.clone())
            .unwrap_or_else(|| NULL_FINGERPRINT.to_string())
    }

    pub fn fingerprints(&self, key: &ConfigKey) -> Fingerprints {
        self.get(key)
            .map(|item| item.read().formal().fingerprints.clone())
            .unwrap_or_else(Fingerprints::null)
    }

    /// Timestamp of the formal variant, `-1` when absent.
    pub fn last_modified(&self, key: &ConfigKey) -> i64 {
        self.get(key)
            .map(|item| item.read().formal().last_modified)
            .unwrap_or(NULL_TIMESTAMP)
    }

    pub fn variant_state(&self, key: &ConfigKey, target: &VariantTarget) -> Option<VariantState> {
        let item = self.get(key)?;
        let store = item.read();
        let variant = match target {
            VariantTarget::Formal => Some(store.formal()).filter(|v| v.is_populated()),
            VariantTarget::Gray(name) => store.gray(name).map(|gray| &gray.variant),
            VariantTarget::Tag(tag) => store.tag(tag),
            VariantTarget::Beta => store.beta().map(|beta| &beta.variant),
        }?;
        Some(VariantState {
            last_modified: variant.last_modified,
            md5: variant.fingerprints.utf8.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_item::DefaultCacheFactory;
    use crate::gray_rule::rule_document;
    use std::thread;

    fn table() -> CacheTable {
        CacheTable::new(
            Arc::new(DiskCache::disabled()),
            Arc::new(DefaultCacheFactory),
            Duration::from_millis(10),
        )
    }

    fn variant(content: &str, ts: i64) -> ReleaseVariant {
        ReleaseVariant::new(content, Fingerprints::of(content), None, ts)
    }

    #[test]
    fn test_absent_key() {
        let table = table();
        let key = ConfigKey::new("", "G", "D");
        assert_eq!(table.content_fingerprint(&key), "null");
        assert_eq!(table.last_modified(&key), -1);
        assert_eq!(table.remove(&key).unwrap(), DumpOutcome::NotFound);
        assert_eq!(table.remove_gray(&key, "g").unwrap(), DumpOutcome::NotFound);
        assert!(table.variant_state(&key, &VariantTarget::Formal).is_none());
    }

    #[test]
    fn test_dump_rules() {
        let table = table();
        let key = ConfigKey::new("", "G", "D");

        assert_eq!(table.dump(&key, variant("a", 10)).unwrap(), DumpOutcome::Updated);
        // Same input twice is a no-op.
        assert_eq!(table.dump(&key, variant("a", 10)).unwrap(), DumpOutcome::Unchanged);
        assert_eq!(table.dump(&key, variant("b", 5)).unwrap(), DumpOutcome::Outdated);
        assert_eq!(
            table.dump(&key, variant("a", 20)).unwrap(),
            DumpOutcome::TimestampUpdated
        );
        assert_eq!(table.last_modified(&key), 20);
        assert_eq!(table.content_fingerprint(&key), Fingerprints::of("a").utf8);

        // Same timestamp, new content wins.
        assert_eq!(table.dump(&key, variant("c", 20)).unwrap(), DumpOutcome::Updated);
        assert_eq!(table.content_fingerprint(&key), Fingerprints::of("c").utf8);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = table();
        let key = ConfigKey::new("", "G", "D");
        table.dump(&key, variant("a", 1)).unwrap();
        table
            .dump_gray(&key, "g", variant("b", 1), &rule_document("tag", "t", 1))
            .unwrap();
        let item = table.get(&key).unwrap();

        assert_eq!(table.remove(&key).unwrap(), DumpOutcome::Removed);
        assert_eq!(table.remove(&key).unwrap(), DumpOutcome::NotFound);
        assert!(table.get(&key).is_none());
        assert!(item.is_detached());
        assert!(table.is_empty());
    }

    #[test]
    fn test_gray_channel() {
        let table = table();
        let key = ConfigKey::new("", "G", "D");
        let rule = rule_document("label", "x=y", 1);

        assert_eq!(
            table.dump_gray(&key, "g", variant("a", 1), &rule).unwrap(),
            DumpOutcome::Updated
        );
        assert_eq!(
            table.dump_gray(&key, "g", variant("a", 1), &rule).unwrap(),
            DumpOutcome::Unchanged
        );
        // A rule change alone replaces the variant.
        let new_rule = rule_document("label", "x=z", 1);
        assert_eq!(
            table.dump_gray(&key, "g", variant("a", 1), &new_rule).unwrap(),
            DumpOutcome::Updated
        );
        assert!(matches!(
            table.dump_gray(&key, "g", variant("b", 2), "oops"),
            Err(CacheError::InvalidRule(_))
        ));
        let state = table
            .variant_state(&key, &VariantTarget::Gray("g".into()))
            .unwrap();
        assert_eq!(state.md5, Fingerprints::of("a").utf8);

        // Formal is untouched by gray dumps.
        assert_eq!(table.last_modified(&key), -1);
        assert_eq!(table.remove_gray(&key, "g").unwrap(), DumpOutcome::Removed);
        assert_eq!(table.remove_gray(&key, "g").unwrap(), DumpOutcome::NotFound);
    }

    #[test]
    fn test_tag_and_beta_channels() {
        let table = table();
        let key = ConfigKey::new("", "G", "D");

        table.dump_tag(&key, "blue", variant("t", 3)).unwrap();
        assert_eq!(
            table.dump_tag(&key, "blue", variant("t2", 2)).unwrap(),
            DumpOutcome::Outdated
        );
        table.dump_beta(&key, variant("b", 1), "10.0.0.1").unwrap();
        assert_eq!(
            table.dump_beta(&key, variant("b", 1), "10.0.0.1,10.0.0.2").unwrap(),
            DumpOutcome::Updated
        );
        let item = table.get(&key).unwrap();
        assert!(item.read().beta_for("10.0.0.2").is_some());
        drop(item);

        assert_eq!(table.remove_tag(&key, "blue").unwrap(), DumpOutcome::Removed);
        assert_eq!(table.remove_beta(&key).unwrap(), DumpOutcome::Removed);
        assert_eq!(table.remove_beta(&key).unwrap(), DumpOutcome::NotFound);
    }

    #[test]
    fn test_lock_timeout() {
        let table = table();
        let key = ConfigKey::new("", "G", "D");
        table.dump(&key, variant("a", 1)).unwrap();
        let item = table.get(&key).unwrap();
        let _reader = item.read();

        let result = table.dump(&key, variant("b", 2));
        assert!(matches!(result, Err(CacheError::LockTimeout(_))));
        assert!(result.unwrap_err().is_transient());
    }

    #[test]
    fn test_writes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let table = CacheTable::new(
            Arc::new(DiskCache::new(dir.path())),
            Arc::new(DefaultCacheFactory),
            Duration::from_millis(10),
        );
        let key = ConfigKey::new("ns1", "G", "D");
        table.dump(&key, variant("a=1", 1)).unwrap();
        assert_eq!(
            table.disk().read(&key, &VariantTarget::Formal).unwrap(),
            Some("a=1".to_string())
        );
        table.remove(&key).unwrap();
        assert_eq!(table.disk().read(&key, &VariantTarget::Formal).unwrap(), None);
    }

    #[test]
    fn test_concurrent_dumps_converge() {
        let table = Arc::new(table());
        let key = ConfigKey::new("", "G", "D");
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = table.clone();
                let key = key.clone();
                thread::spawn(move || {
                    for ts in 0..50 {
                        let content = format!("v{}", ts * 8 + i);
                        // Lock timeouts are transient; retry until applied.
                        while table.dump(&key, variant(&content, ts * 8 + i)).is_err() {}
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.last_modified(&key), 399);
        assert_eq!(table.content_fingerprint(&key), Fingerprints::of("v399").utf8);
        assert_eq!(table.len(), 1);
    }
}
