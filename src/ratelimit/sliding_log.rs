//! Sliding window log.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use super::engine::Outcome;
use super::key::CounterKey;
use super::rules::Rule;
use crate::clock::Clock;
use crate::store::{SharedStore, StoreResult};

/// Number of windows below the current window start that the legacy trim
/// reaches back.
pub const LEGACY_TRIM_WINDOWS: i64 = 5;

/// How aged entries are removed from the log before counting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogTrim {
    /// Remove every entry at or before the window start.
    #[default]
    Full,
    /// Remove only entries scored in `[start - 5 * window, start]`.
    ///
    /// Deprecated. Entries that fall below that band before a request trims
    /// them are never removed and count against the limit forever, which
    /// eventually locks the key out. Kept for deployments that depend on the
    /// old key contents.
    LegacyBand,
}

/// Records one timestamped entry per admitted request and counts the entries
/// of the trailing window.
///
/// Trim, count and append are separate store commands. Within a process they
/// are serialized per log key; across instances they can interleave.
pub struct SlidingWindowLog {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    trim: LogTrim,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SlidingWindowLog {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, trim: LogTrim) -> Self {
        Self {
            store,
            clock,
            trim,
            locks: DashMap::new(),
        }
    }

    pub fn trim(&self) -> LogTrim {
        self.trim
    }

    fn lock_for(&self, log_key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(log_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Admit the request if fewer than `max_requests` entries remain in the
    /// log after trimming, appending an entry for it.
    pub async fn check(&self, rule: &Rule, key: &CounterKey) -> StoreResult<Outcome> {
        let log_key = key.log();
        let lock = self.lock_for(&log_key);
        let _guard = lock.lock().await;

        let now = self.clock.now_millis();
        let window = i64::try_from(rule.window().as_millis()).unwrap_or(i64::MAX);
        let window_start = now.saturating_sub(window);

        let trimmed = match self.trim {
            LogTrim::Full => {
                self.store
                    .sorted_set_remove_range_by_score(&log_key, i64::MIN, window_start)
                    .await?
            }
            LogTrim::LegacyBand => {
                let trim_floor =
                    window_start.saturating_sub(LEGACY_TRIM_WINDOWS.saturating_mul(window));
                let aged = self
                    .store
                    .sorted_set_range_by_score(&log_key, trim_floor, window_start)
                    .await?;
                self.store.sorted_set_remove(&log_key, &aged).await?
            }
        };

        let count = self.store.sorted_set_cardinality(&log_key).await?;
        trace!(key = %log_key, trimmed, count, limit = rule.max_requests, "Checking sliding log");

        if count >= rule.max_requests {
            debug!(
                key = %log_key,
                count,
                limit = rule.max_requests,
                "Sliding log limit exceeded"
            );
            return Ok(Outcome::Limited { count });
        }

        let member = Uuid::new_v4().to_string();
        self.store.sorted_set_add(&log_key, now, &member).await?;
        Ok(Outcome::Allowed { count: count + 1 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::time::Duration;

    const START: i64 = 1_700_000_000_000;

    fn setup(trim: LogTrim, max_requests: u64) -> (SlidingWindowLog, Arc<MemoryStore>, ManualClock, Rule) {
        let clock = ManualClock::new(START);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let log = SlidingWindowLog::new(store.clone(), Arc::new(clock.clone()), trim);
        let rule = Rule {
            domain: "/resource".to_string(),
            key: "plan".to_string(),
            value: "free".to_string(),
            max_requests,
            window_secs: Some(10),
            ..Rule::default()
        };
        (log, store, clock, rule)
    }

    #[tokio::test]
    async fn test_admits_up_to_limit_within_window() {
        let (log, store, clock, rule) = setup(LogTrim::Full, 3);
        let key = CounterKey::for_rule(&rule);

        for expected in 1..=3 {
            let outcome = log.check(&rule, &key).await.unwrap();
            assert_eq!(outcome, Outcome::Allowed { count: expected });
            clock.advance(Duration::from_secs(2));
        }

        let outcome = log.check(&rule, &key).await.unwrap();
        assert_eq!(outcome, Outcome::Limited { count: 3 });
        assert_eq!(store.sorted_set_cardinality(&key.log()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (log, _, clock, rule) = setup(LogTrim::Full, 2);
        let key = CounterKey::for_rule(&rule);

        // t=0 and t=6
        assert!(log.check(&rule, &key).await.unwrap().is_allowed());
        clock.advance(Duration::from_secs(6));
        assert!(log.check(&rule, &key).await.unwrap().is_allowed());

        // t=9: both entries still inside the last 10s
        clock.advance(Duration::from_secs(3));
        assert!(!log.check(&rule, &key).await.unwrap().is_allowed());

        // t=10: the t=0 entry sits exactly on the window start and is dropped
        clock.advance(Duration::from_secs(1));
        assert!(log.check(&rule, &key).await.unwrap().is_allowed());
        assert!(!log.check(&rule, &key).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_full_trim_discards_stale_entries() {
        let (log, store, _, rule) = setup(LogTrim::Full, 2);
        let key = CounterKey::for_rule(&rule);

        // far older than start - 5 windows
        let ancient = START - Duration::from_secs(3600).as_millis() as i64;
        store.sorted_set_add(&key.log(), ancient, "a").await.unwrap();
        store.sorted_set_add(&key.log(), ancient + 1, "b").await.unwrap();

        assert!(log.check(&rule, &key).await.unwrap().is_allowed());
        assert_eq!(store.sorted_set_cardinality(&key.log()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_huge_window_does_not_overflow() {
        for trim in [LogTrim::Full, LogTrim::LegacyBand] {
            let (log, store, clock, mut rule) = setup(trim, 2);
            rule.window_secs = Some(2_000_000_000_000_000);
            let key = CounterKey::for_rule(&rule);

            assert!(log.check(&rule, &key).await.unwrap().is_allowed());
            clock.advance(Duration::from_secs(86_400 * 30));
            assert!(log.check(&rule, &key).await.unwrap().is_allowed());
            assert!(!log.check(&rule, &key).await.unwrap().is_allowed());
            assert_eq!(store.sorted_set_cardinality(&key.log()).await.unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn test_legacy_band_trims_recent_aged_entries() {
        let (log, store, _, rule) = setup(LogTrim::LegacyBand, 2);
        let key = CounterKey::for_rule(&rule);

        // inside [start - 60s, start - 10s]
        let aged = START - Duration::from_secs(30).as_millis() as i64;
        store.sorted_set_add(&key.log(), aged, "a").await.unwrap();
        store.sorted_set_add(&key.log(), aged + 1, "b").await.unwrap();

        assert!(log.check(&rule, &key).await.unwrap().is_allowed());
        assert_eq!(store.sorted_set_cardinality(&key.log()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_legacy_band_keeps_entries_below_trim_floor() {
        let (log, store, clock, rule) = setup(LogTrim::LegacyBand, 2);
        let key = CounterKey::for_rule(&rule);

        // trim floor is start - 60s; these are older than that
        let stale = START - Duration::from_secs(61).as_millis() as i64;
        store.sorted_set_add(&key.log(), stale, "a").await.unwrap();
        store.sorted_set_add(&key.log(), stale + 1, "b").await.unwrap();

        // the stale entries fill the limit and never age out
        assert_eq!(
            log.check(&rule, &key).await.unwrap(),
            Outcome::Limited { count: 2 }
        );
        clock.advance(Duration::from_secs(3600));
        assert_eq!(
            log.check(&rule, &key).await.unwrap(),
            Outcome::Limited { count: 2 }
        );
        assert_eq!(store.sorted_set_cardinality(&key.log()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_legacy_band_lockout_after_idle_gap() {
        let (log, store, clock, rule) = setup(LogTrim::LegacyBand, 2);
        let key = CounterKey::for_rule(&rule);

        assert!(log.check(&rule, &key).await.unwrap().is_allowed());
        assert!(log.check(&rule, &key).await.unwrap().is_allowed());

        // idle long enough for both entries to fall under the trim floor
        clock.advance(Duration::from_secs(120));
        assert!(!log.check(&rule, &key).await.unwrap().is_allowed());
        assert_eq!(store.sorted_set_cardinality(&key.log()).await.unwrap(), 2);

        // the same gap under full trimming recovers
        let (log, _, clock, rule) = setup(LogTrim::Full, 2);
        assert!(log.check(&rule, &key).await.unwrap().is_allowed());
        assert!(log.check(&rule, &key).await.unwrap().is_allowed());
        clock.advance(Duration::from_secs(120));
        assert!(log.check(&rule, &key).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_rejection_does_not_append() {
        let (log, store, _, rule) = setup(LogTrim::Full, 1);
        let key = CounterKey::for_rule(&rule);

        assert!(log.check(&rule, &key).await.unwrap().is_allowed());
        for _ in 0..5 {
            assert!(!log.check(&rule, &key).await.unwrap().is_allowed());
        }
        assert_eq!(store.sorted_set_cardinality(&key.log()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_millisecond_entries_are_distinct() {
        let (log, store, _, rule) = setup(LogTrim::Full, 10);
        let key = CounterKey::for_rule(&rule);

        for _ in 0..4 {
            assert!(log.check(&rule, &key).await.unwrap().is_allowed());
        }
        assert_eq!(store.sorted_set_cardinality(&key.log()).await.unwrap(), 4);
    }
}
