//! Everything that moves rows from the durable store into the cache.
pub mod dump_all;
pub mod hook;
pub mod processor;
pub mod scheduler;

use crate::cache_table::CacheError;
use crate::repository::RepositoryError;
use crate::types::{ConfigKey, VariantTarget};
use std::fmt;

/// Identity under which pending tasks merge: one per key and channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub key: ConfigKey,
    pub target: VariantTarget,
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            VariantTarget::Formal => write!(f, "{}", self.key),
            other => write!(f, "{}+{}", self.key, other),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DumpTask {
    pub key: ConfigKey,
    pub target: VariantTarget,
    pub last_modified: i64,
    pub is_remove: bool,
    /// Address of the node or client that caused the task, for auditing.
    pub source: Option<String>,
}

impl DumpTask {
    pub fn dump(key: ConfigKey, target: VariantTarget, last_modified: i64) -> Self {
        DumpTask {
            key,
            target,
            last_modified,
            is_remove: false,
            source: None,
        }
    }

    pub fn remove(key: ConfigKey, target: VariantTarget, last_modified: i64) -> Self {
        DumpTask {
            is_remove: true,
            ..DumpTask::dump(key, target, last_modified)
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn task_key(&self) -> TaskKey {
        TaskKey {
            key: self.key.clone(),
            target: self.target.clone(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DumpError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("invalid row {0}: {1}")]
    InvalidRow(TaskKey, &'static str),
}

impl DumpError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DumpError::Repository(_) => true,
            DumpError::Cache(e) => e.is_transient(),
            DumpError::InvalidRow(..) => false,
        }
    }

    /// The local disk can no longer hold the cache.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DumpError::Cache(CacheError::DiskFull(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_task_key_display() {
        let key = ConfigKey::new("ns1", "G", "D");
        let task = DumpTask::dump(key.clone(), VariantTarget::Formal, 1);
        assert_eq!(task.task_key().to_string(), "D+G+ns1");
        let task = DumpTask::remove(key, VariantTarget::Gray("canary".into()), 1);
        assert!(task.is_remove);
        assert_eq!(task.task_key().to_string(), "D+G+ns1+gray:canary");
    }

    #[test]
    fn test_error_classes() {
        let key = ConfigKey::new("", "G", "D");
        assert!(DumpError::Repository(RepositoryError::Unavailable("down".into())).is_retryable());
        assert!(DumpError::Cache(CacheError::LockTimeout(key.clone())).is_retryable());
        let full = DumpError::Cache(CacheError::DiskFull(io::Error::from(io::ErrorKind::StorageFull)));
        assert!(full.is_fatal());
        assert!(!full.is_retryable());
        let invalid = DumpError::InvalidRow(
            TaskKey {
                key,
                target: VariantTarget::Beta,
            },
            "missing address list",
        );
        assert!(!invalid.is_retryable());
    }
}
