//! Redis implementation of [`KvStore`] for breaker state shared by several
//! dispatcher processes.
//!
//! Each key is a hash holding the version (`v`) and the value (`d`).
//! Compare-and-set runs as a Lua script so the version check and the write
//! are one atomic step on the server.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::error::WebhookError;
use crate::kv::{KvStore, VersionedValue};

const CAS_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[1], 'v')
if current == false then
    if ARGV[1] ~= '' then return 0 end
elseif current ~= ARGV[1] then
    return 0
end
local next = (tonumber(current) or 0) + 1
redis.call('HSET', KEYS[1], 'v', next, 'd', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return 1
";

pub struct RedisKvStore {
    client: redis::Client,
    prefix: String,
    cas: redis::Script,
}

impl RedisKvStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            cas: redis::Script::new(CAS_SCRIPT),
        }
    }

    /// Open a client for `url`.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::Redis` if the URL is invalid.
    pub fn open(url: &str, prefix: impl Into<String>) -> Result<Self, WebhookError> {
        Ok(Self::new(redis::Client::open(url)?, prefix))
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, WebhookError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, WebhookError> {
        let mut conn = self.connection().await?;
        let (version, value): (Option<u64>, Option<String>) =
            conn.hget(self.key(key), &["v", "d"]).await?;
        Ok(match (version, value) {
            (Some(version), Some(value)) => Some(VersionedValue { value, version }),
            _ => None,
        })
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: String,
        ttl: Duration,
    ) -> Result<bool, WebhookError> {
        let mut conn = self.connection().await?;
        let expected = expected_version.map(|v| v.to_string()).unwrap_or_default();
        let written: i32 = self
            .cas
            .key(self.key(key))
            .arg(expected)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn set_many(
        &self,
        entries: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<(), WebhookError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let ttl = ttl_millis(ttl);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            let key = self.key(&key);
            pipe.hincr(&key, "v", 1)
                .ignore()
                .hset(&key, "d", value)
                .ignore()
                .pexpire(&key, ttl as i64)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), WebhookError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let keys: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }
}
