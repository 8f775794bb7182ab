//! Key-value backend trait and in-process implementation.
//!
//! The store delegates durability to an external key-value service.
//! `Backend` captures the handful of primitives the persistence and
//! locking protocols need; the default production implementation is
//! Redis, while `MemoryBackend` serves tests and single-process
//! embedding with zero external dependencies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;

/// Primitive operations against the key-value service.
///
/// Plain keys hold workflow records and lock tokens; hash keys hold the
/// per-kind job buckets. `set_nx_px` and `del_if_eq` are the two
/// operations the locking discipline is built from: atomic acquire with
/// a bounded lifetime, and release only by the owner.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Set `key` only if absent, with a time-to-live in milliseconds.
    /// Returns whether the key was set.
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Delete `key` only if it currently holds `value`. Returns whether
    /// a deletion happened.
    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Bound the key's remaining lifetime to `ttl` seconds.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;

    /// All keys matching a glob-style pattern (`*` wildcards only).
    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
enum Stored {
    Plain(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process backend over a mutexed map.
///
/// Expiry is lazy: entries past their deadline are treated as absent on
/// access and dropped on the next write that touches them. `set_nx_px`
/// is atomic under the map mutex, which is what the lock tests rely on.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).filter(|e| !e.expired()).and_then(|e| {
            match &e.value {
                Stored::Plain(v) => Some(v.clone()),
                Stored::Hash(_) => None,
            }
        }))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Plain(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let occupied = entries.get(key).map(|e| !e.expired()).unwrap_or(false);
        if occupied {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Plain(value.to_string()),
                expires_at: Some(Instant::now() + Duration::from_millis(ttl_ms)),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let matches = entries
            .get(key)
            .filter(|e| !e.expired())
            .map(|e| matches!(&e.value, Stored::Plain(v) if v == value))
            .unwrap_or(false);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).is_some_and(|e| !e.expired()))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            if !entry.expired() {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
            }
        }
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                if e.expired() {
                    e.value = Stored::Hash(HashMap::new());
                    e.expires_at = None;
                }
            })
            .or_insert_with(|| Entry {
                value: Stored::Hash(HashMap::new()),
                expires_at: None,
            });
        if let Stored::Hash(map) = &mut entry.value {
            map.insert(field.to_string(), value.to_string());
        } else {
            entry.value = Stored::Hash(HashMap::from([(
                field.to_string(),
                value.to_string(),
            )]));
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).filter(|e| !e.expired()).and_then(|e| {
            match &e.value {
                Stored::Hash(map) => map.get(field).cloned(),
                Stored::Plain(_) => None,
            }
        }))
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.expired())
            .map(|e| match &e.value {
                Stored::Hash(map) => map
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                Stored::Plain(_) => Vec::new(),
            })
            .unwrap_or_default())
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|(k, e)| !e.expired() && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Minimal glob matcher supporting `*` wildcards, mirroring the subset
/// of Redis MATCH syntax the store's key patterns use.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == candidate;
    }

    let mut rest = candidate;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }
    // pattern ended with '*'
    true
}
