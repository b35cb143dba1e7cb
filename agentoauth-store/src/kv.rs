//! State back-end trait
//!
//! Defines the key-value contract the state manager runs against. All
//! implementations must be Send + Sync for use in async contexts, and the
//! conditional operations must be atomic per key.

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Async key-value store with per-key atomic conditional writes.
///
/// Single-flighting of mutations is achieved by callers through
/// `compare_and_set` retry loops; cross-key ordering is not guaranteed.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key; `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditionally write a key, optionally with a TTL
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Atomically write only when the key is absent. Returns true when the
    /// write happened.
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.compare_and_set(key, None, value, ttl).await
    }

    /// Atomically replace `expected` with `new`. `expected == None` means
    /// the key must be absent. Returns false on conflict.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Atomically add `delta` to an integer counter, creating it at zero.
    /// Returns the new value. The TTL applies from this write onward.
    async fn increment_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64>;

    /// Delete a key; returns true when it existed
    async fn delete(&self, key: &str) -> Result<bool>;
}
