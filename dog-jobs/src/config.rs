use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_ENV_PREFIX: &str = "DOG_JOBS";

/// Where job records live
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreConfig {
    /// Records are lost when the process exits
    #[default]
    Memory,
    /// Append-only datafile at `path`
    File { path: PathBuf },
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub store: StoreConfig,
    /// Timeout used by [`Queue::close`](crate::Queue::close)
    pub shutdown_timeout: Duration,
    /// Pause after a failed claim before a worker asks again
    pub error_backoff: Duration,
    /// Buffer of the event broadcast channel
    pub event_capacity: usize,
    /// Worker count used by [`Queue::process_default`](crate::Queue::process_default)
    pub default_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::Memory,
            shutdown_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
            event_capacity: 1000,
            default_concurrency: 1,
        }
    }
}

impl QueueConfig {
    /// Defaults overridden by `DOG_JOBS__*` environment variables
    pub fn from_env() -> Self {
        Self::from_env_with_prefix(DEFAULT_ENV_PREFIX)
    }

    /// Defaults overridden by `{prefix}__*` environment variables
    pub fn from_env_with_prefix(prefix: &str) -> Self {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for
    /// `{prefix}__STORE_PATH`, `{prefix}__SHUTDOWN_TIMEOUT_MS`,
    /// `{prefix}__ERROR_BACKOFF_MS`, `{prefix}__EVENT_CAPACITY` and
    /// `{prefix}__DEFAULT_CONCURRENCY`.
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| {
            let key = format!("{}__{}", prefix, name);
            lookup(&key).map(|value| (key, value))
        };

        let store = match get("STORE_PATH") {
            Some((_, path)) if !path.trim().is_empty() => StoreConfig::File {
                path: PathBuf::from(path.trim()),
            },
            _ => defaults.store,
        };

        Self {
            store,
            shutdown_timeout: get("SHUTDOWN_TIMEOUT_MS")
                .map(|(key, value)| parse_or(&key, &value, defaults.shutdown_timeout.as_millis() as u64))
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),
            error_backoff: get("ERROR_BACKOFF_MS")
                .map(|(key, value)| parse_or(&key, &value, defaults.error_backoff.as_millis() as u64))
                .map(Duration::from_millis)
                .unwrap_or(defaults.error_backoff),
            event_capacity: get("EVENT_CAPACITY")
                .map(|(key, value)| parse_or(&key, &value, defaults.event_capacity))
                .unwrap_or(defaults.event_capacity)
                .max(1),
            default_concurrency: get("DEFAULT_CONCURRENCY")
                .map(|(key, value)| parse_or(&key, &value, defaults.default_concurrency))
                .unwrap_or(defaults.default_concurrency),
        }
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_file_store(self, path: impl Into<PathBuf>) -> Self {
        self.with_store(StoreConfig::File { path: path.into() })
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_default_concurrency(mut self, concurrency: usize) -> Self {
        self.default_concurrency = concurrency;
        self
    }
}

fn parse_or<T: FromStr + Copy>(key: &str, value: &str, default: T) -> T {
    match value.trim().parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(key, value, "ignoring unparseable configuration value");
            default
        }
    }
}
