//! Redis state back-end
//!
//! Cluster deployment binding. Conditional writes run as Lua scripts so the
//! compare-and-set contract holds under concurrent evaluators.

use crate::error::{Result, StoreError};
use crate::kv::KvStore;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use tracing::info;

const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
local ok
if ARGV[1] == '0' then
  ok = (current == false)
else
  ok = (current == ARGV[2])
end
if ok then
  if tonumber(ARGV[4]) > 0 then
    redis.call('SET', KEYS[1], ARGV[3], 'EX', ARGV[4])
  else
    redis.call('SET', KEYS[1], ARGV[3])
  end
  return 1
end
return 0
"#;

const INCR_SCRIPT: &str = r#"
local next = redis.call('INCRBY', KEYS[1], ARGV[1])
if tonumber(ARGV[2]) > 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return next
"#;

/// Redis-backed key-value store
pub struct RedisStore {
    conn: MultiplexedConnection,
    cas: Script,
    incr: Script,
}

impl RedisStore {
    /// Connect to the configured back-end URL
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!("Connected to Redis state back-end");
        Ok(Self {
            conn,
            cas: Script::new(CAS_SCRIPT),
            incr: Script::new(INCR_SCRIPT),
        })
    }

    fn ttl_secs(ttl: Option<Duration>) -> u64 {
        // Sub-second TTLs round up so a short-lived entry still expires
        ttl.map(|t| t.as_secs().max(1)).unwrap_or(0)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(t) => conn
                .set_ex::<_, _, ()>(key, value, t.as_secs().max(1))
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string())),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string())),
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .cas
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(new)
            .arg(Self::ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(outcome == 1)
    }

    async fn increment_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        let mut conn = self.conn.clone();
        self.incr
            .key(key)
            .arg(delta)
            .arg(Self::ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| match e.kind() {
                redis::ErrorKind::TypeError => StoreError::InvalidValue {
                    key: key.to_string(),
                    message: "counter is not an integer".to_string(),
                },
                _ => StoreError::Unavailable(e.to_string()),
            })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .del(key)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(removed > 0)
    }
}
