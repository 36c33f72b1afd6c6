//! In-process store for single-instance runs and tests.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use super::{SharedStore, StoreResult};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// Sorted set ordered by `(score, member)`, with a member index so re-adding
/// a member moves it instead of duplicating it.
#[derive(Debug, Default)]
struct SortedSet {
    ordered: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

impl SortedSet {
    fn add(&mut self, score: i64, member: &str) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => self.ordered.remove(&(score, member.to_string())),
            None => false,
        }
    }

    fn range(&self, min: i64, max: i64) -> Vec<String> {
        if min > max {
            return Vec::new();
        }
        self.ordered
            .range((min, String::new())..)
            .take_while(|(score, _)| *score <= max)
            .map(|(_, member)| member.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }

    fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[derive(Debug)]
enum Value {
    Text(String),
    Sorted(SortedSet),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    /// Expiry in epoch milliseconds
    expires_at: Option<i64>,
}

impl Slot {
    fn text(value: impl Into<String>, expires_at: Option<i64>) -> Self {
        Self {
            value: Value::Text(value.into()),
            expires_at,
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Malformed {
        key: key.to_string(),
        reason: "operation against a key holding the wrong kind of value".to_string(),
    }
}

fn parse_count(key: &str, raw: &str) -> StoreResult<i64> {
    raw.parse::<i64>().map_err(|_| StoreError::Malformed {
        key: key.to_string(),
        reason: format!("value {raw:?} is not an integer"),
    })
}

/// Store that keeps all state in a [`DashMap`].
///
/// Every command takes the shard lock of its key for its whole duration, so
/// single commands are atomic exactly as they are on Redis. Expired keys are
/// dropped lazily on access.
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expiry(&self, ttl: Duration) -> i64 {
        let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_millis().saturating_add(ttl)
    }

    fn evict_if_expired(&self, key: &str) {
        let now = self.clock.now_millis();
        self.entries.remove_if(key, |_, slot| slot.is_expired(now));
    }

    /// Run `f` against the sorted set at `key`, creating it if `create` is set.
    fn with_sorted_set<T>(
        &self,
        key: &str,
        create: bool,
        f: impl FnOnce(&mut SortedSet) -> T,
    ) -> StoreResult<Option<T>> {
        self.evict_if_expired(key);
        let mut slot = if create {
            self.entries.entry(key.to_string()).or_insert_with(|| Slot {
                value: Value::Sorted(SortedSet::default()),
                expires_at: None,
            })
        } else {
            match self.entries.get_mut(key) {
                Some(slot) => slot,
                None => return Ok(None),
            }
        };

        let result = match &mut slot.value {
            Value::Sorted(set) => f(set),
            Value::Text(_) => return Err(wrong_type(key)),
        };

        let emptied = matches!(&slot.value, Value::Sorted(set) if set.is_empty());
        drop(slot);
        if emptied {
            self.entries
                .remove_if(key, |_, slot| matches!(&slot.value, Value::Sorted(set) if set.is_empty()));
        }
        Ok(Some(result))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.evict_if_expired(key);
        match self.entries.get(key) {
            Some(slot) => match &slot.value {
                Value::Text(text) => Ok(Some(text.clone())),
                Value::Sorted(_) => Err(wrong_type(key)),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = ttl.map(|ttl| self.expiry(ttl));
        self.entries.insert(key.to_string(), Slot::text(value, expires_at));
        Ok(())
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        self.evict_if_expired(key);
        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Slot::text("0", None));
        let next = match &slot.value {
            Value::Text(raw) => parse_count(key, raw)? + 1,
            Value::Sorted(_) => return Err(wrong_type(key)),
        };
        slot.value = Value::Text(next.to_string());
        Ok(next)
    }

    async fn increment_within(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> StoreResult<Option<u64>> {
        let now = self.clock.now_millis();
        let expires_at = Some(self.expiry(ttl));

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    if limit == 0 {
                        occupied.remove();
                        return Ok(None);
                    }
                    occupied.insert(Slot::text("1", expires_at));
                    return Ok(Some(1));
                }

                let slot = occupied.get_mut();
                let current = match &slot.value {
                    Value::Text(raw) => parse_count(key, raw)?,
                    Value::Sorted(_) => return Err(wrong_type(key)),
                };
                let current = current.max(0) as u64;
                if current >= limit {
                    return Ok(None);
                }
                slot.value = Value::Text((current + 1).to_string());
                if current == 0 {
                    slot.expires_at = expires_at;
                }
                Ok(Some(current + 1))
            }
            Entry::Vacant(vacant) => {
                if limit == 0 {
                    return Ok(None);
                }
                vacant.insert(Slot::text("1", expires_at));
                Ok(Some(1))
            }
        }
    }

    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        self.with_sorted_set(key, true, |set| set.add(score, member))?;
        Ok(())
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> StoreResult<Vec<String>> {
        Ok(self
            .with_sorted_set(key, false, |set| set.range(min, max))?
            .unwrap_or_default())
    }

    async fn sorted_set_remove(&self, key: &str, members: &[String]) -> StoreResult<usize> {
        Ok(self
            .with_sorted_set(key, false, |set| {
                members.iter().filter(|member| set.remove(member)).count()
            })?
            .unwrap_or(0))
    }

    async fn sorted_set_remove_range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> StoreResult<usize> {
        Ok(self
            .with_sorted_set(key, false, |set| {
                let doomed = set.range(min, max);
                doomed.iter().filter(|member| set.remove(member)).count()
            })?
            .unwrap_or(0))
    }

    async fn sorted_set_pop_min(&self, key: &str, count: usize) -> StoreResult<Vec<String>> {
        Ok(self
            .with_sorted_set(key, false, |set| {
                let lowest: Vec<String> = set
                    .ordered
                    .iter()
                    .take(count)
                    .map(|(_, member)| member.clone())
                    .collect();
                for member in &lowest {
                    set.remove(member);
                }
                lowest
            })?
            .unwrap_or_default())
    }

    async fn sorted_set_cardinality(&self, key: &str) -> StoreResult<u64> {
        Ok(self
            .with_sorted_set(key, false, |set| set.len() as u64)?
            .unwrap_or(0))
    }
}
