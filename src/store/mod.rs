//! Shared state store abstraction.
//!
//! Every Floodgate instance reads the active rule and the rate limit counters
//! from one store. The trait exposes the narrow set of key-value and
//! sorted-set commands the limiters need; [`RedisStore`] talks to a real
//! server, [`MemoryStore`] keeps everything in-process.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

/// Result type for store commands.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Commands the rate limiter issues against the shared store.
///
/// Each method is a single command and is atomic on its own. Sequences of
/// calls are not transactional and may interleave with other callers.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a string value. A missing or expired key yields `Ok(None)`.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a string value, with an expiry if `ttl` is set.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Increment an integer value, creating it at 1 if absent. Keeps any
    /// existing expiry.
    async fn increment(&self, key: &str) -> StoreResult<i64>;

    /// Atomically increment the counter at `key` unless it has reached `limit`.
    ///
    /// An absent counter is created at 1 with expiry `ttl`. An existing
    /// counter is incremented without touching its expiry. Returns the new
    /// count, or `None` when the counter was already at or above `limit`.
    async fn increment_within(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> StoreResult<Option<u64>>;

    /// Add `member` to the sorted set at `key` with the given score.
    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> StoreResult<()>;

    /// Members with `min <= score <= max`, in ascending score order.
    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> StoreResult<Vec<String>>;

    /// Remove the given members. Returns how many were present.
    async fn sorted_set_remove(&self, key: &str, members: &[String]) -> StoreResult<usize>;

    /// Remove every member with `min <= score <= max`. Returns how many were removed.
    async fn sorted_set_remove_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> StoreResult<usize>;

    /// Remove and return up to `count` members with the lowest scores.
    async fn sorted_set_pop_min(&self, key: &str, count: usize) -> StoreResult<Vec<String>>;

    /// Number of members in the sorted set at `key` (0 if absent).
    async fn sorted_set_cardinality(&self, key: &str) -> StoreResult<u64>;
}
