//! Redis-backed shared store.
//!
//! Every command runs on a clone of one `ConnectionManager` and is bounded
//! by the configured command timeout. A command that times out fails with
//! [`StoreError::Timeout`]; the admission filter decides what that means for
//! the request.

use ::redis::aio::ConnectionManager;
use ::redis::{Client, RedisResult, Script};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::{SharedStore, StoreResult};
use crate::error::StoreError;

/// Upper bound on establishing the initial connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Conditional increment used by the fixed window counter.
///
/// KEYS[1] counter key, ARGV[1] limit, ARGV[2] window in milliseconds.
/// Returns the new count, or -1 when the counter is already at the limit.
const INCREMENT_WITHIN_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local limit = tonumber(ARGV[1])
if current >= limit then
    return -1
end
if current <= 0 then
    redis.call('SET', KEYS[1], 1, 'PX', ARGV[2])
    return 1
end
return redis.call('INCR', KEYS[1])
"#;

/// Store backed by a Redis (or Redis-compatible) server.
pub struct RedisStore {
    connection: ConnectionManager,
    command_timeout: Duration,
    increment_within: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a `PING`.
    pub async fn connect(url: &str, command_timeout: Duration) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| {
            warn!(error = %e, "Failed to create Redis client");
            StoreError::from(e)
        })?;

        let connection = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(CONNECT_TIMEOUT))??;

        let store = Self {
            connection,
            command_timeout,
            increment_within: Script::new(INCREMENT_WITHIN_SCRIPT),
        };

        let mut conn = store.connection.clone();
        let pong: String = store
            .run(async move { ::redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        debug!(reply = %pong, "Connected to Redis");

        Ok(store)
    }

    async fn run<T, F>(&self, command: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        with_deadline(self.command_timeout, command).await
    }
}

/// Await a command, failing with `Timeout` past `deadline`.
async fn with_deadline<T, F>(deadline: Duration, command: F) -> StoreResult<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(deadline, command).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(deadline)),
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection.clone();
        self.run(async move {
            ::redis::cmd("GET")
                .arg(key)
                .query_async::<Option<String>>(&mut conn)
                .await
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        self.run(async move { cmd.query_async::<()>(&mut conn).await })
            .await
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection.clone();
        self.run(async move {
            ::redis::cmd("INCR")
                .arg(key)
                .query_async::<i64>(&mut conn)
                .await
        })
        .await
    }

    async fn increment_within(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> StoreResult<Option<u64>> {
        let mut conn = self.connection.clone();
        let script = &self.increment_within;
        let ttl_ms = ttl.as_millis() as u64;
        let count: i64 = self
            .run(async move {
                script
                    .key(key)
                    .arg(limit)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(u64::try_from(count).ok())
    }

    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        self.run(async move {
            ::redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> StoreResult<Vec<String>> {
        let mut conn = self.connection.clone();
        self.run(async move {
            ::redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(min)
                .arg(max)
                .query_async::<Vec<String>>(&mut conn)
                .await
        })
        .await
    }

    async fn sorted_set_remove(&self, key: &str, members: &[String]) -> StoreResult<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        self.run(async move {
            ::redis::cmd("ZREM")
                .arg(key)
                .arg(members)
                .query_async::<usize>(&mut conn)
                .await
        })
        .await
    }

    async fn sorted_set_remove_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> StoreResult<usize> {
        let mut conn = self.connection.clone();
        self.run(async move {
            ::redis::cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(min)
                .arg(max)
                .query_async::<usize>(&mut conn)
                .await
        })
        .await
    }

    async fn sorted_set_pop_min(&self, key: &str, count: usize) -> StoreResult<Vec<String>> {
        let mut conn = self.connection.clone();
        // reply is flat: member, score, member, score, ...
        let popped: Vec<String> = self
            .run(async move {
                ::redis::cmd("ZPOPMIN")
                    .arg(key)
                    .arg(count)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(popped.into_iter().step_by(2).collect())
    }

    async fn sorted_set_cardinality(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.connection.clone();
        self.run(async move {
            ::redis::cmd("ZCARD")
                .arg(key)
                .query_async::<u64>(&mut conn)
                .await
        })
        .await
    }
}
