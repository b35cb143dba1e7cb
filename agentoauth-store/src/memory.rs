//! In-memory state back-end
//!
//! Used for testing and single-node development. Not persistent. All
//! operations run under one mutex, which trivially satisfies the per-key
//! atomicity contract.

use crate::error::{Result, StoreError};
use crate::kv::KvStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory key-value store
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Snapshot of live keys, for tests asserting state purity
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn live_value(entries: &HashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
        entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value.clone())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        Ok(Self::live_value(&entries, key, now))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let current = Self::live_value(&entries, key, now);

        if current.as_deref() != expected {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: new.to_string(),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(true)
    }

    async fn increment_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let current = match Self::live_value(&entries, key, now) {
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::InvalidValue {
                key: key.to_string(),
                message: "counter is not an integer".to_string(),
            })?,
            None => 0,
        };

        let next = current + delta;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.remove(key) {
            Some(entry) => Ok(!entry.is_expired(now)),
            None => Ok(false),
        }
    }
}
