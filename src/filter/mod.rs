//! Admission filter.
//!
//! The single entry point the HTTP layer calls before dispatching a request.
//! It resolves the active rule, runs the rule's strategy and turns the result,
//! or any failure along the way, into a [`Decision`].

mod middleware;

pub use middleware::{
    admission_middleware, log_requests, query_pairs, recover_panics, INTERNAL_ERROR_MSG,
};

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::error::FloodgateError;
use crate::ratelimit::{Engine, Outcome, RuleRegistry};

/// Body message of an over-limit rejection.
pub const TOO_MANY_REQUESTS_MSG: &str = "Too Many Request";

/// Body message of a fail-closed rejection.
pub const UNAVAILABLE_MSG: &str = "Rate Limiter Unavailable";

/// What to do with a request when the limiter itself fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let the request through unlimited
    #[default]
    FailOpen,
    /// Reject the request with 503
    FailClosed,
}

/// A rejected request: the status and `msg` body to answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub message: &'static str,
}

impl Rejection {
    pub fn too_many_requests() -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: TOO_MANY_REQUESTS_MSG,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: UNAVAILABLE_MSG,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Reject(Rejection),
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// Decision counters, so bypasses caused by failures are visible.
#[derive(Debug, Default)]
pub struct FilterStats {
    /// Requests no rule applied to
    unmatched: AtomicU64,
    /// Matched requests within the limit
    admitted: AtomicU64,
    /// Matched requests over the limit
    limited: AtomicU64,
    /// Failures that let the request through
    fail_open: AtomicU64,
    /// Failures that rejected the request
    fail_closed: AtomicU64,
}

/// Point-in-time copy of [`FilterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub unmatched: u64,
    pub admitted: u64,
    pub limited: u64,
    pub fail_open: u64,
    pub fail_closed: u64,
}

impl FilterStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            unmatched: self.unmatched.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            limited: self.limited.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
            fail_closed: self.fail_closed.load(Ordering::Relaxed),
        }
    }
}

/// Decides, per request, whether to forward it or reject it.
pub struct AdmissionFilter {
    registry: RuleRegistry,
    engine: Engine,
    policy: FailurePolicy,
    stats: FilterStats,
}

impl AdmissionFilter {
    pub fn new(registry: RuleRegistry, engine: Engine, policy: FailurePolicy) -> Self {
        Self {
            registry,
            engine,
            policy,
            stats: FilterStats::default(),
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Evaluate a request by its path and query pairs.
    pub async fn evaluate(&self, path: &str, query: &[(String, String)]) -> Decision {
        let rule = match self.registry.resolve(path, query).await {
            Ok(Some(rule)) => rule,
            Ok(None) => {
                self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
                return Decision::Admit;
            }
            Err(e) => return self.on_failure("resolve rule", path, &e),
        };

        match self.engine.check(&rule).await {
            Ok(Outcome::Allowed { count }) => {
                self.stats.admitted.fetch_add(1, Ordering::Relaxed);
                debug!(path = %path, count, limit = rule.max_requests, "Request admitted");
                Decision::Admit
            }
            Ok(Outcome::Limited { count }) => {
                self.stats.limited.fetch_add(1, Ordering::Relaxed);
                debug!(path = %path, count, limit = rule.max_requests, "Request rate limited");
                Decision::Reject(Rejection::too_many_requests())
            }
            Err(e) => self.on_failure("check counters", path, &FloodgateError::from(e)),
        }
    }

    fn on_failure(&self, stage: &str, path: &str, error: &FloodgateError) -> Decision {
        match self.policy {
            FailurePolicy::FailOpen => {
                self.stats.fail_open.fetch_add(1, Ordering::Relaxed);
                warn!(stage, path = %path, error = %error, "Rate limiter failed, admitting request");
                Decision::Admit
            }
            FailurePolicy::FailClosed => {
                self.stats.fail_closed.fetch_add(1, Ordering::Relaxed);
                warn!(stage, path = %path, error = %error, "Rate limiter failed, rejecting request");
                Decision::Reject(Rejection::unavailable())
            }
        }
    }
}
