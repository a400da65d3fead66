//! Redis-backed shared store.

use std::future::Future;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, Script};
use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::store::{SharedStore, StoreError};

const TAKE_OVER: &str = r#"
local current = redis.call("GET", KEYS[1])
if (not current) or (ARGV[1] ~= "" and current == ARGV[1]) then
  redis.call("SET", KEYS[1], ARGV[2], "PX", ARGV[3])
  return 1
end
return 0
"#;

const DELETE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
end
return 0
"#;

const SCAN_BATCH: usize = 500;

pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    op_timeout: Duration,
    take_over: Script,
    delete_if_equals: Script,
}

impl RedisStore {
    /// Create a store; the connection is opened lazily on first use.
    pub fn new(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        Ok(Self {
            client: Client::open(url)?,
            connection: OnceCell::new(),
            op_timeout,
            take_over: Script::new(TAKE_OVER),
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| {
                tracing::debug!("Initializing redis connection manager");
                self.client.get_connection_manager()
            })
            .await?;
        Ok(manager.clone())
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.op_timeout))?
    }

    async fn scan_keys(&self, con: &mut ConnectionManager, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(con)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.bounded(async {
            let mut con = self.connection().await?;
            let value: Option<Vec<u8>> = ::redis::cmd("GET").arg(key).query_async(&mut con).await?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.bounded(async {
            let mut con = self.connection().await?;
            ::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async::<()>(&mut con)
                .await?;
            Ok(())
        })
        .await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.bounded(async {
            let mut con = self.connection().await?;
            let reply: Option<String> = ::redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut con)
                .await?;
            Ok(reply.is_some())
        })
        .await
    }

    async fn take_over(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.bounded(async {
            let mut con = self.connection().await?;
            let taken: i64 = self
                .take_over
                .key(key)
                .arg(expected.unwrap_or(""))
                .arg(value)
                .arg(ttl.as_millis() as u64)
                .invoke_async(&mut con)
                .await?;
            Ok(taken == 1)
        })
        .await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.bounded(async {
            let mut con = self.connection().await?;
            let deleted: i64 = self
                .delete_if_equals
                .key(key)
                .arg(expected)
                .invoke_async(&mut con)
                .await?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        self.bounded(async {
            let mut con = self.connection().await?;
            let keys = self.scan_keys(&mut con, prefix).await?;
            let mut deleted = 0u64;
            for chunk in keys.chunks(SCAN_BATCH) {
                let n: u64 = ::redis::cmd("DEL").arg(chunk).query_async(&mut con).await?;
                deleted += n;
            }
            Ok(deleted)
        })
        .await
    }

    async fn count_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        self.bounded(async {
            let mut con = self.connection().await?;
            Ok(self.scan_keys(&mut con, prefix).await?.len() as u64)
        })
        .await
    }
}
