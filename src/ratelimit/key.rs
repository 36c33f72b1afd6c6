//! Counter key derivation.

use super::rules::Rule;

/// Identifies the bucket of requests a rule's limit applies to.
///
/// Built from the rule's domain and matched query pair, so two requests share
/// a key exactly when they match the same rule on the same values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub domain: String,
    pub key: String,
    pub value: String,
}

impl CounterKey {
    pub fn new(domain: &str, key: &str, value: &str) -> Self {
        Self {
            domain: domain.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn for_rule(rule: &Rule) -> Self {
        Self::new(&rule.domain, &rule.key, &rule.value)
    }

    /// Store key of the fixed window counter: `{domain}:{key}:{value}`.
    pub fn counter(&self) -> String {
        format!("{}:{}:{}", self.domain, self.key, self.value)
    }

    /// Store key of the sliding window log.
    ///
    /// Kept apart from the counter key so a rule switching algorithms never
    /// finds a string where it expects a sorted set.
    pub fn log(&self) -> String {
        format!("{}:log", self.counter())
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.counter())
    }
}
