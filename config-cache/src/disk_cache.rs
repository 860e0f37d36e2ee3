//! Local copy of released content, used to serve a quick restart before the
//! durable store has been read.
//!
//! Layout under the base directory:
//!
//! ```text
//! data/config-data/{group}/{data_id}
//! data/config-data-tenant/{namespace}/{group}/{data_id}
//! data/beta-data[-tenant]/...{data_id}
//! data/tag-data[-tenant]/...{data_id}/{tag}
//! data/gray-data[-tenant]/...{data_id}/{gray_name}
//! status/heartBeat.txt
//! ```
use crate::cursor::ChangeCursor;
use crate::types::{ConfigKey, VariantTarget, is_safe_component};
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

const DATA_DIR: &str = "data";
const STATUS_DIR: &str = "status";
const HEARTBEAT_FILE: &str = "heartBeat.txt";

#[derive(thiserror::Error, Debug)]
pub enum DiskCacheError {
    #[error("local disk is full: {0}")]
    DiskFull(io::Error),

    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("unsafe cache path component: {0:?}")]
    UnsafePath(String),
}

impl From<io::Error> for DiskCacheError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::StorageFull | ErrorKind::QuotaExceeded => DiskCacheError::DiskFull(err),
            _ => DiskCacheError::Io(err),
        }
    }
}

/// A formal variant read back from disk.
#[derive(Debug, PartialEq)]
pub struct DiskEntry {
    pub key: ConfigKey,
    pub content: String,
    pub modified: i64,
}

pub struct DiskCache {
    base_dir: PathBuf,
    enabled: bool,
}

impl DiskCache {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        DiskCache {
            base_dir: base_dir.into(),
            enabled: true,
        }
    }

    /// Direct-read mode: every operation is a no-op.
    pub fn disabled() -> Self {
        DiskCache {
            base_dir: PathBuf::new(),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn channel_root(&self, key: &ConfigKey, target: &VariantTarget) -> PathBuf {
        let channel = match target {
            VariantTarget::Formal => "config-data",
            VariantTarget::Beta => "beta-data",
            VariantTarget::Tag(_) => "tag-data",
            VariantTarget::Gray(_) => "gray-data",
        };
        let mut path = self.base_dir.join(DATA_DIR);
        if key.namespace.is_empty() {
            path.push(channel);
        } else {
            path.push(format!("{channel}-tenant"));
            path.push(&key.namespace);
        }
        path.push(&key.group);
        path.push(&key.data_id);
        path
    }

    fn path_for(&self, key: &ConfigKey, target: &VariantTarget) -> Result<PathBuf, DiskCacheError> {
        for component in [&key.namespace, &key.group, &key.data_id] {
            if !is_safe_component(component) {
                return Err(DiskCacheError::UnsafePath(component.clone()));
            }
        }
        let mut path = self.channel_root(key, target);
        match target {
            VariantTarget::Tag(name) | VariantTarget::Gray(name) => {
                if name.is_empty() || !is_safe_component(name) {
                    return Err(DiskCacheError::UnsafePath(name.clone()));
                }
                path.push(name);
            }
            VariantTarget::Formal | VariantTarget::Beta => {}
        }
        Ok(path)
    }

    /// The file's modification time is set to `last_modified`, which is
    /// what a quick start reads back as the variant's timestamp.
    pub fn save(
        &self,
        key: &ConfigKey,
        target: &VariantTarget,
        content: &str,
        last_modified: i64,
    ) -> Result<(), DiskCacheError> {
        if !self.enabled {
            return Ok(());
        }
        let path = self.path_for(key, target)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&path)?;
        file.write_all(content.as_bytes())?;
        if let Ok(millis) = u64::try_from(last_modified) {
            file.set_modified(UNIX_EPOCH + Duration::from_millis(millis))?;
        }
        Ok(())
    }

    pub fn remove(&self, key: &ConfigKey, target: &VariantTarget) -> Result<(), DiskCacheError> {
        if !self.enabled {
            return Ok(());
        }
        let path = self.path_for(key, target)?;
        ignore_missing(fs::remove_file(path))
    }

    /// Removes every channel stored for the key.
    pub fn remove_all(&self, key: &ConfigKey) -> Result<(), DiskCacheError> {
        if !self.enabled {
            return Ok(());
        }
        self.remove(key, &VariantTarget::Formal)?;
        self.remove(key, &VariantTarget::Beta)?;
        for target in [
            VariantTarget::Tag(String::new()),
            VariantTarget::Gray(String::new()),
        ] {
            ignore_missing(fs::remove_dir_all(self.channel_root(key, &target)))?;
        }
        Ok(())
    }

    pub fn read(&self, key: &ConfigKey, target: &VariantTarget) -> Result<Option<String>, DiskCacheError> {
        if !self.enabled {
            return Ok(None);
        }
        match fs::read_to_string(self.path_for(key, target)?) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads every formal variant on disk. Timestamps are file modification
    /// times, which `save` sets to the row's last modification.
    pub fn load_formal(&self) -> Result<Vec<DiskEntry>, DiskCacheError> {
        let mut entries = Vec::new();
        if !self.enabled {
            return Ok(entries);
        }
        let data = self.base_dir.join(DATA_DIR);

        for (group, group_dir) in list_dir(&data.join("config-data"))? {
            for (data_id, path) in list_dir(&group_dir)? {
                entries.push(read_entry(ConfigKey::new("", &group, data_id), &path)?);
            }
        }
        for (namespace, ns_dir) in list_dir(&data.join("config-data-tenant"))? {
            for (group, group_dir) in list_dir(&ns_dir)? {
                for (data_id, path) in list_dir(&group_dir)? {
                    let key = ConfigKey::new(namespace.as_str(), group.as_str(), data_id);
                    entries.push(read_entry(key, &path)?);
                }
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    pub fn clear_all(&self) -> Result<(), DiskCacheError> {
        if !self.enabled {
            return Ok(());
        }
        ignore_missing(fs::remove_dir_all(self.base_dir.join(DATA_DIR)))
    }

    fn heartbeat_path(&self) -> PathBuf {
        self.base_dir.join(STATUS_DIR).join(HEARTBEAT_FILE)
    }

    pub fn write_heartbeat(&self, cursor: &ChangeCursor) -> Result<(), DiskCacheError> {
        if !self.enabled {
            return Ok(());
        }
        let path = self.heartbeat_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, cursor.to_string())?;
        Ok(())
    }

    /// An unreadable heartbeat is treated as absent, which forces a cold start.
    pub fn read_heartbeat(&self) -> Result<Option<ChangeCursor>, DiskCacheError> {
        if !self.enabled {
            return Ok(None);
        }
        let raw = match fs::read_to_string(self.heartbeat_path()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match raw.parse() {
            Ok(cursor) => Ok(Some(cursor)),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable heartbeat file");
                Ok(None)
            }
        }
    }
}

fn ignore_missing(result: io::Result<()>) -> Result<(), DiskCacheError> {
    match result {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn list_dir(dir: &Path) -> Result<Vec<(String, PathBuf)>, DiskCacheError> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut children = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            children.push((name.to_string(), entry.path()));
        }
    }
    Ok(children)
}

fn read_entry(key: ConfigKey, path: &Path) -> Result<DiskEntry, DiskCacheError> {
    let content = fs::read_to_string(path)?;
    let modified = fs::metadata(path)?
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default();
    Ok(DiskEntry {
        key,
        content,
        modified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_formal() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let plain = ConfigKey::new("", "G", "D");
        let tenant = ConfigKey::new("ns1", "G", "D");

        cache.save(&plain, &VariantTarget::Formal, "a=1", 1).unwrap();
        cache.save(&tenant, &VariantTarget::Formal, "a=2", 1_700_000_000_123).unwrap();
        cache.save(&tenant, &VariantTarget::Tag("blue".into()), "tagged", 1).unwrap();

        assert!(dir.path().join("data/config-data/G/D").is_file());
        assert!(dir.path().join("data/config-data-tenant/ns1/G/D").is_file());
        assert!(dir.path().join("data/tag-data-tenant/ns1/G/D/blue").is_file());

        let entries = cache.load_formal().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, plain);
        assert_eq!(entries[0].content, "a=1");
        assert_eq!(entries[1].key, tenant);
        assert_eq!(entries[0].modified, 1);
        assert_eq!(entries[1].modified, 1_700_000_000_123);
    }

    #[test]
    fn test_remove_all() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let key = ConfigKey::new("", "G", "D");

        cache.save(&key, &VariantTarget::Formal, "f", 1).unwrap();
        cache.save(&key, &VariantTarget::Beta, "b", 1).unwrap();
        cache.save(&key, &VariantTarget::Gray("g1".into()), "g", 1).unwrap();
        cache.remove_all(&key).unwrap();
        // Removing again is fine.
        cache.remove_all(&key).unwrap();

        assert_eq!(cache.read(&key, &VariantTarget::Formal).unwrap(), None);
        assert_eq!(cache.read(&key, &VariantTarget::Beta).unwrap(), None);
        assert_eq!(cache.read(&key, &VariantTarget::Gray("g1".into())).unwrap(), None);
    }

    #[test]
    fn test_unsafe_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let key = ConfigKey::new("", "G", "D");
        assert!(matches!(
            cache.save(&key, &VariantTarget::Gray("../x".into()), "x", 1),
            Err(DiskCacheError::UnsafePath(_))
        ));
        assert!(matches!(
            cache.save(&ConfigKey::new("", "..", "D"), &VariantTarget::Formal, "x", 1),
            Err(DiskCacheError::UnsafePath(_))
        ));
    }

    #[test]
    fn test_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        assert_eq!(cache.read_heartbeat().unwrap(), None);

        cache.write_heartbeat(&ChangeCursor::at(1234)).unwrap();
        assert_eq!(cache.read_heartbeat().unwrap(), Some(ChangeCursor::at(1234)));

        fs::write(dir.path().join("status/heartBeat.txt"), "garbage!").unwrap();
        assert_eq!(cache.read_heartbeat().unwrap(), None);
    }

    #[test]
    fn test_clear_all_and_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let key = ConfigKey::new("", "G", "D");
        cache.save(&key, &VariantTarget::Formal, "f", 1).unwrap();
        cache.clear_all().unwrap();
        assert!(cache.load_formal().unwrap().is_empty());

        let disabled = DiskCache::disabled();
        disabled.save(&key, &VariantTarget::Formal, "f", 1).unwrap();
        assert_eq!(disabled.read(&key, &VariantTarget::Formal).unwrap(), None);
        assert!(!disabled.is_enabled());
    }

    #[test]
    fn test_disk_full_classification() {
        let err: DiskCacheError = io::Error::from(ErrorKind::StorageFull).into();
        assert!(matches!(err, DiskCacheError::DiskFull(_)));
        let err: DiskCacheError = io::Error::from(ErrorKind::PermissionDenied).into();
        assert!(matches!(err, DiskCacheError::Io(_)));
    }
}
