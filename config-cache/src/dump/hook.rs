use crate::cache_table::DumpOutcome;
use crate::dump::DumpTask;
use crate::fingerprint::{Fingerprints, md5_legacy, md5_utf8};
use crate::types::ConfigRow;
use std::sync::Arc;

/// Extension point around each applied row.
pub trait DumpHook: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fingerprints the row's content will be cached under.
    fn before_dump(&self, row: &ConfigRow) -> Fingerprints;

    fn after_dump(&self, _task: &DumpTask, _outcome: DumpOutcome) {}
}

/// Recomputes both fingerprints from the content.
pub struct Md5Hook;

impl DumpHook for Md5Hook {
    fn name(&self) -> &'static str {
        "md5"
    }

    fn before_dump(&self, row: &ConfigRow) -> Fingerprints {
        Fingerprints::of(&row.content)
    }
}

/// Trusts the UTF-8 fingerprint recorded by the writer when there is one.
pub struct StoredMd5Hook;

impl DumpHook for StoredMd5Hook {
    fn name(&self) -> &'static str {
        "stored"
    }

    fn before_dump(&self, row: &ConfigRow) -> Fingerprints {
        Fingerprints {
            legacy: md5_legacy(&row.content),
            utf8: row
                .md5
                .clone()
                .filter(|md5| !md5.is_empty())
                .unwrap_or_else(|| md5_utf8(&row.content)),
        }
    }
}

pub fn dump_hook(name: &str) -> Option<Arc<dyn DumpHook>> {
    match name {
        "md5" => Some(Arc::new(Md5Hook)),
        "stored" => Some(Arc::new(StoredMd5Hook)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfigKey, VariantTarget};

    fn row(md5: Option<&str>) -> ConfigRow {
        ConfigRow {
            id: 1,
            key: ConfigKey::new("", "G", "D"),
            target: VariantTarget::Formal,
            content: "hello".into(),
            md5: md5.map(String::from),
            encrypted_data_key: None,
            last_modified: 1,
            gray_rule: None,
            beta_ips: None,
        }
    }

    #[test]
    fn test_hooks() {
        let md5 = dump_hook("md5").unwrap();
        assert_eq!(md5.before_dump(&row(Some("abc"))), Fingerprints::of("hello"));

        let stored = dump_hook("stored").unwrap();
        assert_eq!(stored.before_dump(&row(Some("abc"))).utf8, "abc");
        assert_eq!(stored.before_dump(&row(None)), Fingerprints::of("hello"));

        assert!(dump_hook("sha1").is_none());
    }
}
