//! Decides which released variant a client receives.
//!
//! Precedence: explicit tag, then the best matching gray rule, then the
//! legacy beta list, then the formal release.
use crate::cache_item::{GrayResolution, ReleaseVariant};
use crate::cache_table::CacheTable;
use crate::types::{CLIENT_IP_LABEL, ConfigKey, QueryStatus};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct ConfigQuery {
    pub key: ConfigKey,
    pub tag: Option<String>,
    pub labels: HashMap<String, String>,
    pub client_ip: Option<String>,
}

impl ConfigQuery {
    pub fn new(key: ConfigKey) -> Self {
        ConfigQuery {
            key,
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }

    /// The labels rules are matched against. The client address is exposed
    /// under its well-known label unless the caller already set one.
    fn effective_labels(&self) -> HashMap<String, String> {
        let mut labels = self.labels.clone();
        if let Some(ip) = &self.client_ip {
            labels
                .entry(CLIENT_IP_LABEL.to_string())
                .or_insert_with(|| ip.clone());
        }
        labels
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    pub status: QueryStatus,
    pub content: Option<Arc<str>>,
    pub md5: Option<String>,
    pub legacy_md5: Option<String>,
    pub last_modified: Option<i64>,
    pub encrypted_data_key: Option<String>,
    pub matched_gray: Option<String>,
}

impl QueryResult {
    fn empty(status: QueryStatus) -> Self {
        QueryResult {
            status,
            content: None,
            md5: None,
            legacy_md5: None,
            last_modified: None,
            encrypted_data_key: None,
            matched_gray: None,
        }
    }

    fn hit(status: QueryStatus, variant: &ReleaseVariant, matched_gray: Option<String>) -> Self {
        QueryResult {
            status,
            content: Some(variant.content.clone()),
            md5: Some(variant.fingerprints.utf8.clone()),
            legacy_md5: Some(variant.fingerprints.legacy.clone()),
            last_modified: Some(variant.last_modified),
            encrypted_data_key: variant.encrypted_data_key.clone(),
            matched_gray,
        }
    }
}

#[derive(Clone)]
pub struct QueryResolutionChain {
    table: Arc<CacheTable>,
}

impl QueryResolutionChain {
    pub fn new(table: Arc<CacheTable>) -> Self {
        QueryResolutionChain { table }
    }

    pub fn resolve(&self, query: &ConfigQuery) -> QueryResult {
        let Some(item) = self.table.get(&query.key) else {
            return QueryResult::empty(match query.tag.as_deref() {
                Some(tag) if !tag.is_empty() => QueryStatus::TagNotFound,
                _ => QueryStatus::NotFound,
            });
        };
        let store = item.read();

        if let Some(tag) = query.tag.as_deref().filter(|tag| !tag.is_empty()) {
            return match store.tag(tag).filter(|v| v.is_populated()) {
                Some(variant) => QueryResult::hit(QueryStatus::Tag, variant, None),
                None => QueryResult::empty(QueryStatus::TagNotFound),
            };
        }

        if store.has_grays() {
            match store.resolve_gray(&query.effective_labels()) {
                GrayResolution::Matched(gray) => {
                    return QueryResult::hit(
                        QueryStatus::Beta,
                        &gray.variant,
                        Some(gray.gray_name.clone()),
                    );
                }
                GrayResolution::Conflict(name) => {
                    tracing::error!(key = %query.key, gray = %name, "Conflicting gray variants");
                    return QueryResult::empty(QueryStatus::GrayConflict);
                }
                GrayResolution::NoMatch => {}
            }
        }

        if let Some(variant) = query.client_ip.as_deref().and_then(|ip| store.beta_for(ip)) {
            return QueryResult::hit(QueryStatus::Beta, variant, None);
        }

        if store.formal().is_populated() {
            return QueryResult::hit(QueryStatus::Formal, store.formal(), None);
        }

        QueryResult::empty(QueryStatus::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_item::DefaultCacheFactory;
    use crate::disk_cache::DiskCache;
    use crate::fingerprint::Fingerprints;
    use crate::gray_rule::rule_document;
    use std::time::Duration;

    fn chain() -> (Arc<CacheTable>, QueryResolutionChain) {
        let table = Arc::new(CacheTable::new(
            Arc::new(DiskCache::disabled()),
            Arc::new(DefaultCacheFactory),
            Duration::from_millis(10),
        ));
        (table.clone(), QueryResolutionChain::new(table))
    }

    fn variant(content: &str, ts: i64) -> ReleaseVariant {
        ReleaseVariant::new(content, Fingerprints::of(content), None, ts)
    }

    #[test]
    fn test_canary_release() {
        let (table, chain) = chain();
        let key = ConfigKey::new("ns1", "G", "D");

        table.dump(&key, variant("v1", 100)).unwrap();
        table
            .dump_gray(&key, "canary", variant("v2", 200), &rule_document("label", "tag=beta", 10))
            .unwrap();

        let result = chain.resolve(&ConfigQuery::new(key.clone()).with_label("tag", "beta"));
        assert_eq!(result.status, QueryStatus::Beta);
        assert_eq!(result.content.as_deref(), Some("v2"));
        assert_eq!(result.matched_gray.as_deref(), Some("canary"));
        assert_eq!(result.last_modified, Some(200));

        let result = chain.resolve(&ConfigQuery::new(key.clone()));
        assert_eq!(result.status, QueryStatus::Formal);
        assert_eq!(result.content.as_deref(), Some("v1"));
        assert_eq!(result.md5, Some(Fingerprints::of("v1").utf8));

        table.remove_gray(&key, "canary").unwrap();
        let result = chain.resolve(&ConfigQuery::new(key.clone()).with_label("tag", "beta"));
        assert_eq!(result.status, QueryStatus::Formal);
        assert_eq!(result.content.as_deref(), Some("v1"));
    }

    #[test]
    fn test_canary_not_matched_by_other_labels() {
        let (table, chain) = chain();
        let key = ConfigKey::new("ns1", "G", "D");
        table.dump(&key, variant("v1", 100)).unwrap();
        table
            .dump_gray(&key, "canary", variant("v2", 200), &rule_document("label", "tag=beta", 10))
            .unwrap();

        let result = chain.resolve(&ConfigQuery::new(key).with_label("tag", "prod"));
        assert_eq!(result.status, QueryStatus::Formal);
        assert_eq!(result.content.as_deref(), Some("v1"));
        assert_eq!(result.matched_gray, None);
    }

    #[test]
    fn test_gray_conflict() {
        let table = Arc::new(CacheTable::new(
            Arc::new(DiskCache::disabled()),
            Arc::new(crate::testutils::SameNameFactory),
            Duration::from_millis(10),
        ));
        let chain = QueryResolutionChain::new(table.clone());
        let key = ConfigKey::new("", "G", "D");
        table.dump(&key, variant("formal", 1)).unwrap();
        for name in ["a", "b"] {
            table
                .dump_gray(&key, name, variant(name, 1), &rule_document("label", "x=y", 3))
                .unwrap();
        }

        let result = chain.resolve(&ConfigQuery::new(key.clone()).with_label("x", "y"));
        assert_eq!(result.status, QueryStatus::GrayConflict);
        assert_eq!(result.content, None);
        assert!(!result.status.is_hit());

        // Clients the rules do not target still get the formal release.
        let result = chain.resolve(&ConfigQuery::new(key));
        assert_eq!(result.status, QueryStatus::Formal);
    }

    #[test]
    fn test_tag_is_exclusive() {
        let (table, chain) = chain();
        let key = ConfigKey::new("", "G", "D");
        table.dump(&key, variant("formal", 1)).unwrap();
        table
            .dump_gray(&key, "g", variant("gray", 1), &rule_document("label", "x=y", 1))
            .unwrap();

        let query = ConfigQuery::new(key.clone())
            .with_tag("missing")
            .with_label("x", "y");
        let result = chain.resolve(&query);
        assert_eq!(result.status, QueryStatus::TagNotFound);
        assert_eq!(result.content, None);

        table.dump_tag(&key, "blue", variant("tagged", 1)).unwrap();
        let result = chain.resolve(&ConfigQuery::new(key.clone()).with_tag("blue"));
        assert_eq!(result.status, QueryStatus::Tag);
        assert_eq!(result.content.as_deref(), Some("tagged"));

        // Empty tag is the same as no tag.
        let result = chain.resolve(&ConfigQuery::new(key).with_tag(""));
        assert_eq!(result.status, QueryStatus::Formal);
    }

    #[test]
    fn test_gray_before_beta_before_formal() {
        let (table, chain) = chain();
        let key = ConfigKey::new("", "G", "D");
        table.dump(&key, variant("formal", 1)).unwrap();
        table.dump_beta(&key, variant("beta", 1), "10.0.0.1").unwrap();

        let query = ConfigQuery::new(key.clone()).with_client_ip("10.0.0.1");
        let result = chain.resolve(&query);
        assert_eq!(result.status, QueryStatus::Beta);
        assert_eq!(result.content.as_deref(), Some("beta"));
        assert_eq!(result.matched_gray, None);

        table
            .dump_gray(&key, "ips", variant("gray", 1), &rule_document("beta", "10.0.0.1", 1))
            .unwrap();
        let result = chain.resolve(&query);
        assert_eq!(result.content.as_deref(), Some("gray"));
        assert_eq!(result.matched_gray.as_deref(), Some("ips"));

        let result = chain.resolve(&ConfigQuery::new(key).with_client_ip("10.9.9.9"));
        assert_eq!(result.status, QueryStatus::Formal);
    }

    #[test]
    fn test_not_found() {
        let (table, chain) = chain();
        let key = ConfigKey::new("", "G", "D");
        assert_eq!(chain.resolve(&ConfigQuery::new(key.clone())).status, QueryStatus::NotFound);
        assert_eq!(
            chain.resolve(&ConfigQuery::new(key.clone()).with_tag("t")).status,
            QueryStatus::TagNotFound
        );

        // A key holding only a gray variant has no formal content to fall back on.
        table
            .dump_gray(&key, "g", variant("gray", 1), &rule_document("label", "x=y", 1))
            .unwrap();
        assert_eq!(chain.resolve(&ConfigQuery::new(key)).status, QueryStatus::NotFound);
    }
}
