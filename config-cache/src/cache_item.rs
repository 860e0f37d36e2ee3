//! Per-key storage of every released variant of a configuration.
use crate::fingerprint::Fingerprints;
use crate::gray_rule::{GrayRule, GrayRuleError};
use crate::types::{ConfigKey, NULL_TIMESTAMP};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseVariant {
    pub content: Arc<str>,
    pub fingerprints: Fingerprints,
    pub encrypted_data_key: Option<String>,
    pub last_modified: i64,
}

impl ReleaseVariant {
    pub fn new(
        content: &str,
        fingerprints: Fingerprints,
        encrypted_data_key: Option<String>,
        last_modified: i64,
    ) -> Self {
        ReleaseVariant {
            content: Arc::from(content),
            fingerprints,
            encrypted_data_key,
            last_modified,
        }
    }

    pub fn cleared() -> Self {
        ReleaseVariant {
            content: Arc::from(""),
            fingerprints: Fingerprints::null(),
            encrypted_data_key: None,
            last_modified: NULL_TIMESTAMP,
        }
    }

    pub fn is_populated(&self) -> bool {
        !self.fingerprints.is_null()
    }
}

impl Default for ReleaseVariant {
    fn default() -> Self {
        ReleaseVariant::cleared()
    }
}

#[derive(Debug)]
pub struct GrayVariant {
    pub gray_name: String,
    pub variant: ReleaseVariant,
    pub rule: GrayRule,
}

impl GrayVariant {
    /// Expired variants are kept for inspection but never served.
    pub fn is_valid(&self) -> bool {
        self.rule.is_valid()
    }
}

#[derive(Clone, Debug)]
pub struct BetaVariant {
    pub variant: ReleaseVariant,
    pub ips: BTreeSet<String>,
    /// The address list as it was stored, used to detect changes.
    pub raw_ips: String,
}

impl BetaVariant {
    pub fn new(variant: ReleaseVariant, raw_ips: &str) -> Self {
        BetaVariant {
            variant,
            ips: raw_ips
                .split(',')
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(String::from)
                .collect(),
            raw_ips: raw_ips.to_string(),
        }
    }

    pub fn allows(&self, client_ip: &str) -> bool {
        self.ips.contains(client_ip)
    }
}

pub enum GrayResolution<'a> {
    Matched(&'a GrayVariant),
    /// Two matching variants tie on priority and name. Map keys are unique,
    /// so this only happens when the factory hands out duplicate names.
    Conflict(String),
    NoMatch,
}

/// Builds the per-key stores. Selected by name from configuration.
pub trait CacheFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_cache(&self) -> ReleaseVariant;

    fn create_gray_cache(
        &self,
        gray_name: &str,
        variant: ReleaseVariant,
        rule: GrayRule,
    ) -> GrayVariant;
}

pub struct DefaultCacheFactory;

impl CacheFactory for DefaultCacheFactory {
    fn name(&self) -> &'static str {
        "default"
    }

    fn create_cache(&self) -> ReleaseVariant {
        ReleaseVariant::cleared()
    }

    fn create_gray_cache(
        &self,
        gray_name: &str,
        variant: ReleaseVariant,
        rule: GrayRule,
    ) -> GrayVariant {
        GrayVariant {
            gray_name: gray_name.to_string(),
            variant,
            rule,
        }
    }
}

pub fn cache_factory(name: &str) -> Option<Arc<dyn CacheFactory>> {
    match name {
        "default" => Some(Arc::new(DefaultCacheFactory)),
        _ => None,
    }
}

pub struct ReleaseVariantStore {
    factory: Arc<dyn CacheFactory>,
    formal: ReleaseVariant,
    // None whenever no gray variant exists, so the common case costs nothing.
    grays: Option<HashMap<String, Arc<GrayVariant>>>,
    // Priority descending, then name ascending. Rebuilt on every gray mutation.
    sorted_grays: Option<Vec<Arc<GrayVariant>>>,
    tags: Option<HashMap<String, ReleaseVariant>>,
    beta: Option<BetaVariant>,
    resort_count: u64,
}

impl ReleaseVariantStore {
    pub fn new(factory: Arc<dyn CacheFactory>) -> Self {
        ReleaseVariantStore {
            formal: factory.create_cache(),
            factory,
            grays: None,
            sorted_grays: None,
            tags: None,
            beta: None,
            resort_count: 0,
        }
    }

    pub fn formal(&self) -> &ReleaseVariant {
        &self.formal
    }

    pub fn set_formal(&mut self, variant: ReleaseVariant) {
        self.formal = variant;
    }

    pub(crate) fn touch_formal(&mut self, last_modified: i64) {
        self.formal.last_modified = last_modified;
    }

    pub fn gray(&self, gray_name: &str) -> Option<&GrayVariant> {
        self.grays
            .as_ref()
            .and_then(|grays| grays.get(gray_name))
            .map(|gray| gray.as_ref())
    }

    /// Parses the rule before touching anything, so a bad rule leaves the
    /// store exactly as it was.
    pub fn upsert_gray(
        &mut self,
        gray_name: &str,
        variant: ReleaseVariant,
        raw_rule: &str,
    ) -> Result<(), GrayRuleError> {
        let rule = GrayRule::parse(raw_rule)?;
        self.insert_gray(gray_name, variant, rule);
        Ok(())
    }

    pub(crate) fn insert_gray(&mut self, gray_name: &str, variant: ReleaseVariant, rule: GrayRule) {
        let gray = self.factory.create_gray_cache(gray_name, variant, rule);
        self.grays
            .get_or_insert_with(HashMap::new)
            .insert(gray_name.to_string(), Arc::new(gray));
        self.resort();
    }

    pub(crate) fn touch_gray(&mut self, gray_name: &str, last_modified: i64) {
        let Some(existing) = self.grays.as_ref().and_then(|g| g.get(gray_name)) else {
            return;
        };
        let mut variant = existing.variant.clone();
        variant.last_modified = last_modified;
        let rule = existing.rule.clone();
        self.insert_gray(gray_name, variant, rule);
    }

    pub fn remove_gray(&mut self, gray_name: &str) -> bool {
        let Some(grays) = self.grays.as_mut() else {
            return false;
        };
        if grays.remove(gray_name).is_none() {
            return false;
        }
        if grays.is_empty() {
            self.grays = None;
        }
        self.resort();
        true
    }

    fn resort(&mut self) {
        self.resort_count += 1;
        self.sorted_grays = self.grays.as_ref().map(|grays| {
            let mut sorted: Vec<_> = grays.values().cloned().collect();
            sorted.sort_by(|a, b| {
                b.rule
                    .priority()
                    .cmp(&a.rule.priority())
                    .then_with(|| a.gray_name.cmp(&b.gray_name))
            });
            sorted
        });
    }

    pub fn sorted_grays(&self) -> &[Arc<GrayVariant>] {
        self.sorted_grays.as_deref().unwrap_or(&[])
    }

    pub fn has_grays(&self) -> bool {
        self.grays.is_some()
    }

    /// Number of times the sorted gray view was rebuilt. Reads never rebuild it.
    pub fn resort_count(&self) -> u64 {
        self.resort_count
    }

    pub fn resolve_gray(&self, labels: &HashMap<String, String>) -> GrayResolution<'_> {
        let mut candidates = self
            .sorted_grays()
            .iter()
            .filter(|gray| gray.is_valid() && gray.rule.matches(labels));

        let Some(first) = candidates.next() else {
            return GrayResolution::NoMatch;
        };
        if let Some(second) = candidates.next()
            && second.rule.priority() == first.rule.priority()
            && second.gray_name == first.gray_name
        {
            return GrayResolution::Conflict(first.gray_name.clone());
        }
        GrayResolution::Matched(first)
    }

    pub fn tag(&self, tag: &str) -> Option<&ReleaseVariant> {
        self.tags.as_ref().and_then(|tags| tags.get(tag))
    }

    pub fn set_tag(&mut self, tag: &str, variant: ReleaseVariant) {
        self.tags
            .get_or_insert_with(HashMap::new)
            .insert(tag.to_string(), variant);
    }

    pub(crate) fn touch_tag(&mut self, tag: &str, last_modified: i64) {
        if let Some(variant) = self.tags.as_mut().and_then(|tags| tags.get_mut(tag)) {
            variant.last_modified = last_modified;
        }
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let Some(tags) = self.tags.as_mut() else {
            return false;
        };
        let removed = tags.remove(tag).is_some();
        if tags.is_empty() {
            self.tags = None;
        }
        removed
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.tags
            .as_ref()
            .map(|tags| tags.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn beta(&self) -> Option<&BetaVariant> {
        self.beta.as_ref()
    }

    pub fn set_beta(&mut self, beta: BetaVariant) {
        self.beta = Some(beta);
    }

    pub(crate) fn touch_beta(&mut self, last_modified: i64) {
        if let Some(beta) = self.beta.as_mut() {
            beta.variant.last_modified = last_modified;
        }
    }

    pub fn remove_beta(&mut self) -> bool {
        self.beta.take().is_some()
    }

    pub fn beta_for(&self, client_ip: &str) -> Option<&ReleaseVariant> {
        self.beta
            .as_ref()
            .filter(|beta| beta.variant.is_populated() && beta.allows(client_ip))
            .map(|beta| &beta.variant)
    }
}

/// A cache table entry: the variant store behind its own lock, plus the
/// guard that serializes dumps of this key against each other.
pub struct CacheItem {
    key: ConfigKey,
    store: RwLock<ReleaseVariantStore>,
    pub(crate) dump_guard: Mutex<()>,
    detached: AtomicBool,
}

impl CacheItem {
    pub fn new(key: ConfigKey, factory: Arc<dyn CacheFactory>) -> Self {
        CacheItem {
            key,
            store: RwLock::new(ReleaseVariantStore::new(factory)),
            dump_guard: Mutex::new(()),
            detached: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &ConfigKey {
        &self.key
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ReleaseVariantStore> {
        self.store.read()
    }

    pub(crate) fn store(&self) -> &RwLock<ReleaseVariantStore> {
        &self.store
    }

    /// Set once the item has been removed from its table.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gray_rule::rule_document;

    fn store() -> ReleaseVariantStore {
        ReleaseVariantStore::new(Arc::new(DefaultCacheFactory))
    }

    fn variant(content: &str, ts: i64) -> ReleaseVariant {
        ReleaseVariant::new(content, Fingerprints::of(content), None, ts)
    }

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_new_store_is_cleared() {
        let store = store();
        assert!(!store.formal().is_populated());
        assert_eq!(store.formal().last_modified, NULL_TIMESTAMP);
        assert!(!store.has_grays());
        assert!(store.sorted_grays().is_empty());
    }

    #[test]
    fn test_priority_ordering() {
        let mut store = store();
        for (name, priority) in [("b", 5), ("a", 5), ("c", 3)] {
            store
                .upsert_gray(name, variant(name, 1), &rule_document("label", "x=y", priority))
                .unwrap();
        }
        let order: Vec<_> = store
            .sorted_grays()
            .iter()
            .map(|g| g.gray_name.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);

        match store.resolve_gray(&labels(&[("x", "y")])) {
            GrayResolution::Matched(gray) => assert_eq!(gray.gray_name, "a"),
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn test_duplicate_names_conflict() {
        let mut store = ReleaseVariantStore::new(Arc::new(crate::testutils::SameNameFactory));
        for name in ["a", "b"] {
            store
                .upsert_gray(name, variant(name, 1), &rule_document("label", "x=y", 5))
                .unwrap();
        }
        assert!(matches!(
            store.resolve_gray(&labels(&[("x", "y")])),
            GrayResolution::Conflict(name) if name == "shadow"
        ));
        // Different priorities still pick a single winner.
        store
            .upsert_gray("b", variant("b", 1), &rule_document("label", "x=y", 1))
            .unwrap();
        assert!(matches!(
            store.resolve_gray(&labels(&[("x", "y")])),
            GrayResolution::Matched(_)
        ));
    }

    #[test]
    fn test_invalid_rule_leaves_store_untouched() {
        let mut store = store();
        store
            .upsert_gray("g", variant("one", 1), &rule_document("label", "x=y", 1))
            .unwrap();
        let before = store.resort_count();

        let result = store.upsert_gray("g", variant("two", 2), "{not json");
        assert!(result.is_err());
        assert_eq!(&*store.gray("g").unwrap().variant.content, "one");
        assert_eq!(store.resort_count(), before);

        assert!(store.upsert_gray("h", variant("x", 1), "{}").is_err());
        assert!(store.gray("h").is_none());
    }

    #[test]
    fn test_remove_last_gray_drops_map() {
        let mut store = store();
        store
            .upsert_gray("g", variant("one", 1), &rule_document("tag", "t", 1))
            .unwrap();
        assert!(store.has_grays());
        assert!(store.remove_gray("g"));
        assert!(!store.remove_gray("g"));
        assert!(!store.has_grays());
        assert!(store.sorted_grays().is_empty());
    }

    #[test]
    fn test_reads_never_resort() {
        let mut store = store();
        store
            .upsert_gray("g", variant("one", 1), &rule_document("label", "x=y", 1))
            .unwrap();
        let count = store.resort_count();
        for _ in 0..10 {
            let _ = store.resolve_gray(&labels(&[("x", "y")]));
            let _ = store.sorted_grays();
        }
        assert_eq!(store.resort_count(), count);
    }

    #[test]
    fn test_expired_gray_is_skipped() {
        let mut store = store();
        let expired = r#"{"type":"label","expr":"x=y","priority":9,"expire_at":1}"#;
        store.upsert_gray("old", variant("old", 1), expired).unwrap();
        store
            .upsert_gray("new", variant("new", 1), &rule_document("label", "x=y", 1))
            .unwrap();
        match store.resolve_gray(&labels(&[("x", "y")])) {
            GrayResolution::Matched(gray) => assert_eq!(gray.gray_name, "new"),
            _ => panic!("expected a match"),
        }
        assert!(store.gray("old").is_some());
    }

    #[test]
    fn test_tags() {
        let mut store = store();
        assert!(store.tag("blue").is_none());
        store.set_tag("blue", variant("b", 1));
        store.touch_tag("blue", 7);
        assert_eq!(store.tag("blue").unwrap().last_modified, 7);
        assert_eq!(store.tag_names(), vec!["blue".to_string()]);
        assert!(store.remove_tag("blue"));
        assert!(!store.remove_tag("blue"));
        assert!(store.tag_names().is_empty());
    }

    #[test]
    fn test_beta() {
        let mut store = store();
        store.set_beta(BetaVariant::new(variant("b", 1), "10.0.0.1, 10.0.0.2"));
        assert!(store.beta_for("10.0.0.2").is_some());
        assert!(store.beta_for("10.0.0.3").is_none());
        assert!(store.remove_beta());
        assert!(store.beta_for("10.0.0.2").is_none());
    }

    #[test]
    fn test_factory_lookup() {
        assert_eq!(cache_factory("default").unwrap().name(), "default");
        assert!(cache_factory("unknown").is_none());
    }
}
