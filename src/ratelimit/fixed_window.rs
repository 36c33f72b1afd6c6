//! Fixed window counter.

use std::sync::Arc;
use tracing::{debug, trace};

use super::engine::Outcome;
use super::key::CounterKey;
use super::rules::Rule;
use crate::store::{SharedStore, StoreResult};

/// Counts requests per window in a single store integer.
///
/// The counter is created at 1 with an expiry of one window on the first
/// request, incremented on every admitted request and left to expire on its
/// own. The read-compare-increment runs as one store command, so concurrent
/// callers on any number of instances never push the count past the limit.
pub struct FixedWindowCounter {
    store: Arc<dyn SharedStore>,
}

impl FixedWindowCounter {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Admit the request if the window still has room, counting it.
    ///
    /// Rejected requests do not touch the counter, and their outcome carries
    /// `rule.max_requests` rather than the stored count.
    pub async fn check(&self, rule: &Rule, key: &CounterKey) -> StoreResult<Outcome> {
        let counter_key = key.counter();
        trace!(key = %counter_key, limit = rule.max_requests, "Checking fixed window");

        match self
            .store
            .increment_within(&counter_key, rule.max_requests, rule.window())
            .await?
        {
            Some(count) => {
                trace!(key = %counter_key, count, "Fixed window admitted");
                Ok(Outcome::Allowed { count })
            }
            None => {
                debug!(
                    key = %counter_key,
                    limit = rule.max_requests,
                    "Fixed window limit exceeded"
                );
                Ok(Outcome::Limited {
                    count: rule.max_requests,
                })
            }
        }
    }
}
