//! Configuration management.
//!
//! skein configuration can come from:
//! - Environment variables (SKEIN_*)
//! - Config file (~/.config/skein/config.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// skein configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Worker pool hints
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Continuation lock tuning
    #[serde(default)]
    pub locking: LockingConfig,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis endpoint URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Key namespace prefix shared by all records
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Record TTL in seconds; `None` keeps records until destroyed
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            namespace: default_namespace(),
            ttl_seconds: None,
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_namespace() -> String {
    "skein".to_string()
}

/// Worker pool hints.
///
/// The pool itself is external; skein only carries its sizing hint so
/// one config file can describe the whole deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Suggested number of concurrent workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    5
}

/// Continuation lock tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockingConfig {
    /// Maximum time one continuation step may hold the per-workflow lock,
    /// in seconds. Also bounds how long an acquisition attempt blocks.
    #[serde(default = "default_lock_duration")]
    pub duration_seconds: f64,

    /// Sleep between lock acquisition retries, in seconds.
    #[serde(default = "default_polling_interval")]
    pub polling_interval_seconds: f64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            duration_seconds: default_lock_duration(),
            polling_interval_seconds: default_polling_interval(),
        }
    }
}

fn default_lock_duration() -> f64 {
    2.0
}

fn default_polling_interval() -> f64 {
    0.3
}

impl LockingConfig {
    /// Lock hold/acquisition bound as a `Duration`.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_seconds.max(0.001))
    }

    /// Acquisition retry sleep as a `Duration`.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs_f64(self.polling_interval_seconds.max(0.001))
    }
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("skein"))
            .unwrap_or_else(|| PathBuf::from(".skein"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("SKEIN_STORE_URL") {
            self.store.url = url;
        }
        if let Ok(namespace) = std::env::var("SKEIN_NAMESPACE") {
            self.store.namespace = namespace;
        }
        if let Ok(ttl) = std::env::var("SKEIN_TTL_SECONDS") {
            if let Ok(parsed) = ttl.parse::<u64>() {
                self.store.ttl_seconds = Some(parsed);
            }
        }
        if let Ok(concurrency) = std::env::var("SKEIN_CONCURRENCY") {
            if let Ok(parsed) = concurrency.parse::<usize>() {
                self.worker.concurrency = parsed;
            }
        }
        if let Ok(duration) = std::env::var("SKEIN_LOCK_DURATION_SECONDS") {
            if let Ok(parsed) = duration.parse::<f64>() {
                self.locking.duration_seconds = parsed;
            }
        }
        if let Ok(interval) = std::env::var("SKEIN_POLL_INTERVAL_SECONDS") {
            if let Ok(parsed) = interval.parse::<f64>() {
                self.locking.polling_interval_seconds = parsed;
            }
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(store) = partial.store {
            self.store = store;
        }
        if let Some(worker) = partial.worker {
            self.worker = worker;
        }
        if let Some(locking) = partial.locking {
            self.locking = locking;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    store: Option<StoreConfig>,
    worker: Option<WorkerConfig>,
    locking: Option<LockingConfig>,
}
