//! The admission rule and the registry that publishes and resolves it.
//!
//! Exactly one rule is active at a time. It is loaded from a YAML file at
//! startup, published as JSON under [`STORED_RULES_KEY`] in the shared store,
//! and read back from the store on every request so all instances agree on it.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FloodgateError, Result};
use crate::store::SharedStore;

/// Store key holding the published rule.
pub const STORED_RULES_KEY: &str = "stored_rules";

/// Window used when a rule names neither a unit nor an explicit duration.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Longest window a rule can ask for. Longer `windowSeconds` are capped.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 86_400);

/// Time unit of a rule's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[serde(alias = "seconds")]
    Second,
    #[serde(alias = "minutes")]
    Minute,
    #[serde(alias = "hours")]
    Hour,
    #[serde(alias = "days")]
    Day,
}

impl TimeUnit {
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// Admission algorithm a rule is enforced with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    FixedWindow,
    SlidingLog,
}

/// The admission policy.
///
/// Published payloads use capitalised field names (`Domain`, `MaxRequests`,
/// ...) so rules written by older deployments still decode; rule files use
/// the lower camel case spelling. Both are accepted when reading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Request path the rule applies to
    #[serde(rename = "Domain", alias = "domain", default)]
    pub domain: String,
    /// HTTP method; published with the rule but not matched
    #[serde(rename = "Method", alias = "method", default)]
    pub method: String,
    /// Query parameter name to match
    #[serde(rename = "Key", alias = "key", default)]
    pub key: String,
    /// Query parameter value to match
    #[serde(rename = "Value", alias = "value", default)]
    pub value: String,
    #[serde(rename = "MaxRequests", alias = "maxRequests", default)]
    pub max_requests: u64,
    #[serde(
        rename = "Unit",
        alias = "unit",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub unit: Option<TimeUnit>,
    /// Explicit window length; takes precedence over `unit`
    #[serde(
        rename = "WindowSeconds",
        alias = "windowSeconds",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub window_secs: Option<u64>,
    #[serde(rename = "Algorithm", alias = "algorithm", default)]
    pub algorithm: Algorithm,
}

/// Treat an empty unit string as "no unit".
fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<TimeUnit>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => TimeUnit::deserialize(serde::de::value::StrDeserializer::<D::Error>::new(
            raw.trim(),
        ))
        .map(Some),
    }
}

impl Rule {
    /// Load a rule from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rule");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a rule from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rule: Self = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::RuleFile(format!("Failed to parse rule: {}", e)))?;
        if rule.window_secs.is_some_and(|secs| secs > MAX_WINDOW.as_secs()) {
            warn!(
                window_secs = rule.window_secs,
                max_window_secs = MAX_WINDOW.as_secs(),
                "Rule window too long, capping it"
            );
        }
        Ok(rule)
    }

    /// Load a rule, falling back to the zero-valued rule on any failure.
    ///
    /// The zero rule has an empty domain, which no request path equals, so a
    /// broken rule file disables limiting instead of blocking startup.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(&path) {
            Ok(rule) => rule,
            Err(e) => {
                warn!(
                    path = %path.as_ref().display(),
                    error = %e,
                    "Could not load rule, no requests will be limited"
                );
                Self::default()
            }
        }
    }

    /// Length of the rate limit window, never longer than [`MAX_WINDOW`].
    pub fn window(&self) -> Duration {
        match (self.window_secs, self.unit) {
            (Some(secs), _) if secs > 0 => Duration::from_secs(secs).min(MAX_WINDOW),
            (_, Some(unit)) => unit.duration(),
            _ => DEFAULT_WINDOW,
        }
    }

    /// Whether a request with this path and query applies to the rule.
    ///
    /// The path must equal `domain` exactly and at least one query pair must
    /// equal `(key, value)`.
    pub fn matches(&self, path: &str, query: &[(String, String)]) -> bool {
        path == self.domain && query.iter().any(|(k, v)| *k == self.key && *v == self.value)
    }
}

/// Publishes the active rule to the shared store and resolves it per request.
#[derive(Clone)]
pub struct RuleRegistry {
    store: Arc<dyn SharedStore>,
}

impl RuleRegistry {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Write the rule to the store under [`STORED_RULES_KEY`], without expiry.
    pub async fn publish(&self, rule: &Rule) -> Result<()> {
        let payload = serde_json::to_string(rule)?;
        self.store.set(STORED_RULES_KEY, &payload, None).await?;
        info!(
            domain = %rule.domain,
            key = %rule.key,
            value = %rule.value,
            max_requests = rule.max_requests,
            window_secs = rule.window().as_secs(),
            algorithm = ?rule.algorithm,
            "Published rate limit rule"
        );
        Ok(())
    }

    /// Read the published rule. `Ok(None)` if nothing has been published.
    pub async fn fetch(&self) -> Result<Option<Rule>> {
        match self.store.get(STORED_RULES_KEY).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Return the published rule if this request matches it.
    ///
    /// Store and decoding failures are returned as errors; the caller decides
    /// whether they admit or reject the request.
    pub async fn resolve(&self, path: &str, query: &[(String, String)]) -> Result<Option<Rule>> {
        let Some(rule) = self.fetch().await? else {
            debug!("No rule published");
            return Ok(None);
        };

        if rule.matches(path, query) {
            debug!(path = %path, "Request matched rule");
            Ok(Some(rule))
        } else {
            Ok(None)
        }
    }
}
