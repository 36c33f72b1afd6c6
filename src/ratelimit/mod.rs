//! Rate limiting rules, counters and strategy dispatch.

mod engine;
mod fixed_window;
mod key;
mod rules;
mod sliding_log;

pub use engine::{Engine, Outcome, Strategy};
pub use fixed_window::FixedWindowCounter;
pub use key::CounterKey;
pub use rules::{
    Algorithm, Rule, RuleRegistry, TimeUnit, DEFAULT_WINDOW, MAX_WINDOW, STORED_RULES_KEY,
};
pub use sliding_log::{LogTrim, SlidingWindowLog, LEGACY_TRIM_WINDOWS};
