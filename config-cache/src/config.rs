use crate::cache_item::cache_factory;
use crate::dump::hook::dump_hook;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    fn admin() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 8849,
        }
    }
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 8848,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct LocalCache {
    /// With the local cache disabled every read is served from memory only
    /// and restarts always rebuild from the durable store.
    pub enabled: bool,
    pub base_dir: PathBuf,
    pub quick_start_window_secs: u64,
}

impl Default for LocalCache {
    fn default() -> Self {
        LocalCache {
            enabled: true,
            base_dir: PathBuf::from("cache"),
            quick_start_window_secs: 6 * 60 * 60,
        }
    }
}

impl LocalCache {
    pub fn quick_start_window(&self) -> Duration {
        Duration::from_secs(self.quick_start_window_secs)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Dump {
    pub workers: usize,
    pub retry_delay_ms: u64,
    pub lock_timeout_ms: u64,
    pub page_size: usize,
    pub page_pause_ms: u64,
    pub bulk_interval_secs: u64,
    pub hook: String,
    pub cache_factory: String,
    pub exit_on_disk_full: bool,
}

impl Default for Dump {
    fn default() -> Self {
        Dump {
            workers: 4,
            retry_delay_ms: 1000,
            lock_timeout_ms: 10,
            page_size: 1000,
            page_pause_ms: 0,
            bulk_interval_secs: 6 * 60 * 60,
            hook: "md5".into(),
            cache_factory: "default".into(),
            exit_on_disk_full: true,
        }
    }
}

impl Dump {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn page_pause(&self) -> Duration {
        Duration::from_millis(self.page_pause_ms)
    }

    pub fn bulk_interval(&self) -> Duration {
        Duration::from_secs(self.bulk_interval_secs)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct ChangeDetection {
    pub interval_ms: u64,
    pub page_size: usize,
    pub page_pause_ms: u64,
}

impl Default for ChangeDetection {
    fn default() -> Self {
        ChangeDetection {
            interval_ms: 5000,
            page_size: 100,
            page_pause_ms: 30,
        }
    }
}

impl ChangeDetection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn page_pause(&self) -> Duration {
        Duration::from_millis(self.page_pause_ms)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct History {
    pub enabled: bool,
    pub interval_secs: u64,
    pub retention_days: u64,
    pub batch_size: usize,
}

impl Default for History {
    fn default() -> Self {
        History {
            enabled: true,
            interval_secs: 600,
            retention_days: 30,
            batch_size: 1000,
        }
    }
}

impl History {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default = "Listener::admin")]
    pub admin_listener: Listener,
    #[serde(default)]
    pub local_cache: LocalCache,
    #[serde(default)]
    pub dump: Dump,
    #[serde(default)]
    pub change_detection: ChangeDetection,
    #[serde(default)]
    pub history: History,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listener: Listener::default(),
            admin_listener: Listener::admin(),
            local_cache: LocalCache::default(),
            dump: Dump::default(),
            change_detection: ChangeDetection::default(),
            history: History::default(),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("{0} port must not be zero")]
    ZeroPort(&'static str),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("unknown dump hook: {0}")]
    UnknownHook(String),
    #[error("unknown cache factory: {0}")]
    UnknownCacheFactory(String),
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.listener.port == 0 {
            return Err(ValidationError::ZeroPort("listener"));
        }
        if self.admin_listener.port == 0 {
            return Err(ValidationError::ZeroPort("admin_listener"));
        }
        let positive = [
            ("dump.workers", self.dump.workers as u64),
            ("dump.page_size", self.dump.page_size as u64),
            ("dump.bulk_interval_secs", self.dump.bulk_interval_secs),
            ("change_detection.interval_ms", self.change_detection.interval_ms),
            ("change_detection.page_size", self.change_detection.page_size as u64),
            ("history.interval_secs", self.history.interval_secs),
            ("history.batch_size", self.history.batch_size as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ValidationError::Zero(name));
        }
        if dump_hook(&self.dump.hook).is_none() {
            return Err(ValidationError::UnknownHook(self.dump.hook.clone()));
        }
        if cache_factory(&self.dump.cache_factory).is_none() {
            return Err(ValidationError::UnknownCacheFactory(
                self.dump.cache_factory.clone(),
            ));
        }
        Ok(())
    }
}
