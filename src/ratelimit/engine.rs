//! Strategy selection and dispatch.

use std::sync::Arc;
use tracing::trace;

use super::fixed_window::FixedWindowCounter;
use super::key::CounterKey;
use super::rules::{Algorithm, Rule};
use super::sliding_log::{LogTrim, SlidingWindowLog};
use crate::clock::Clock;
use crate::store::{SharedStore, StoreResult};

/// Result of checking a request against its rule's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Within the limit; `count` includes this request
    Allowed { count: u64 },
    /// Over the limit; nothing was recorded.
    ///
    /// The sliding log reports the live entry count. The fixed window never
    /// reads the stored counter back on rejection and reports the limit it hit.
    Limited { count: u64 },
}

impl Outcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Outcome::Allowed { .. })
    }
}

/// One of the admission algorithms.
pub enum Strategy {
    FixedWindow(FixedWindowCounter),
    SlidingLog(SlidingWindowLog),
}

impl Strategy {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Strategy::FixedWindow(_) => Algorithm::FixedWindow,
            Strategy::SlidingLog(_) => Algorithm::SlidingLog,
        }
    }

    pub async fn check(&self, rule: &Rule, key: &CounterKey) -> StoreResult<Outcome> {
        match self {
            Strategy::FixedWindow(counter) => counter.check(rule, key).await,
            Strategy::SlidingLog(log) => log.check(rule, key).await,
        }
    }
}

/// The rate limiter engine.
///
/// Holds one instance of every strategy, built once at startup against the
/// shared store, and routes each matched rule to the strategy its
/// `algorithm` names.
pub struct Engine {
    fixed_window: Strategy,
    sliding_log: Strategy,
}

impl Engine {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, trim: LogTrim) -> Self {
        Self {
            fixed_window: Strategy::FixedWindow(FixedWindowCounter::new(store.clone())),
            sliding_log: Strategy::SlidingLog(SlidingWindowLog::new(store, clock, trim)),
        }
    }

    /// Pick the strategy that enforces `rule`.
    pub fn select(&self, rule: &Rule) -> &Strategy {
        match rule.algorithm {
            Algorithm::FixedWindow => &self.fixed_window,
            Algorithm::SlidingLog => &self.sliding_log,
        }
    }

    /// Check a matched request against its rule, updating the counters.
    pub async fn check(&self, rule: &Rule) -> StoreResult<Outcome> {
        let key = CounterKey::for_rule(rule);
        let strategy = self.select(rule);
        trace!(key = %key, algorithm = ?strategy.algorithm(), "Dispatching rate limit check");
        strategy.check(rule, &key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn engine() -> (Engine, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (Engine::new(store.clone(), clock, LogTrim::Full), store)
    }

    fn rule(algorithm: Algorithm, max_requests: u64) -> Rule {
        Rule {
            domain: "/resource".to_string(),
            key: "plan".to_string(),
            value: "free".to_string(),
            max_requests,
            window_secs: Some(10),
            algorithm,
            ..Rule::default()
        }
    }

    #[test]
    fn test_select_follows_rule_algorithm() {
        let (engine, _) = engine();
        assert_eq!(
            engine.select(&rule(Algorithm::FixedWindow, 1)).algorithm(),
            Algorithm::FixedWindow
        );
        assert_eq!(
            engine.select(&rule(Algorithm::SlidingLog, 1)).algorithm(),
            Algorithm::SlidingLog
        );
    }

    #[tokio::test]
    async fn test_fixed_window_dispatch_uses_counter_key() {
        let (engine, store) = engine();
        let rule = rule(Algorithm::FixedWindow, 2);

        assert_eq!(engine.check(&rule).await.unwrap(), Outcome::Allowed { count: 1 });
        assert_eq!(
            store.get("/resource:plan:free").await.unwrap().as_deref(),
            Some("1")
        );
        assert_eq!(
            store.sorted_set_cardinality("/resource:plan:free:log").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_sliding_log_dispatch_uses_log_key() {
        let (engine, store) = engine();
        let rule = rule(Algorithm::SlidingLog, 2);

        assert_eq!(engine.check(&rule).await.unwrap(), Outcome::Allowed { count: 1 });
        assert_eq!(
            store.sorted_set_cardinality("/resource:plan:free:log").await.unwrap(),
            1
        );
        assert_eq!(store.get("/resource:plan:free").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sequential_limit_per_algorithm() {
        for algorithm in [Algorithm::FixedWindow, Algorithm::SlidingLog] {
            let (engine, _) = engine();
            let rule = rule(algorithm, 3);

            for i in 1..=3 {
                assert!(
                    engine.check(&rule).await.unwrap().is_allowed(),
                    "{algorithm:?} request {i} should be admitted"
                );
            }
            assert!(
                !engine.check(&rule).await.unwrap().is_allowed(),
                "{algorithm:?} request 4 should be limited"
            );
        }
    }
}
