//! AgentOAuth State Back-End
//!
//! Provides the key-value contract the state manager runs against:
//! - `KvStore` trait with per-key atomic conditional writes
//! - `MemoryStore` for testing and single-node development
//! - `RedisStore` for cluster deployments

pub mod error;
pub mod kv;
pub mod memory;
pub mod redis_store;

pub use error::{Result, StoreError};
pub use kv::KvStore;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
