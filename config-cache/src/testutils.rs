use crate::cache_item::{CacheFactory, DefaultCacheFactory, GrayVariant, ReleaseVariant};
use crate::gray_rule::GrayRule;
use crate::cache_table::CacheTable;
use crate::disk_cache::DiskCache;
use crate::dump::hook::Md5Hook;
use crate::dump::processor::DumpProcessor;
use crate::repository::MemoryRepository;
use crate::types::ConfigKey;
use std::sync::Arc;
use std::time::Duration;

pub fn test_key(data_id: &str) -> ConfigKey {
    ConfigKey::new("", "G", data_id)
}

pub fn test_table() -> Arc<CacheTable> {
    Arc::new(CacheTable::new(
        Arc::new(DiskCache::disabled()),
        Arc::new(DefaultCacheFactory),
        Duration::from_millis(10),
    ))
}

/// A processor over an empty in-memory store and a cache with no disk copy.
pub fn test_processor() -> (Arc<MemoryRepository>, DumpProcessor) {
    let repo = Arc::new(MemoryRepository::new());
    let processor = DumpProcessor::new(repo.clone(), test_table(), Arc::new(Md5Hook));
    (repo, processor)
}

/// Stamps every gray variant with the same name, as a corrupted factory would.
pub struct SameNameFactory;

impl CacheFactory for SameNameFactory {
    fn name(&self) -> &'static str {
        "same-name"
    }

    fn create_cache(&self) -> ReleaseVariant {
        ReleaseVariant::cleared()
    }

    fn create_gray_cache(&self, _gray_name: &str, variant: ReleaseVariant, rule: GrayRule) -> GrayVariant {
        GrayVariant {
            gray_name: "shadow".to_string(),
            variant,
            rule,
        }
    }
}
