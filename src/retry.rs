//! Retry policy: resolution and exponential backoff.

use serde::{Deserialize, Serialize};

/// Backoff parameters for retrying a failed handler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryBehavior {
    /// Total executions allowed, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: i64,
    pub base: f64,
}

impl Default for RetryBehavior {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 250,
            base: 2.0,
        }
    }
}

impl RetryBehavior {
    /// Delay before the given attempt is retried, `attempt` counted from 1:
    /// `initial_backoff_ms * base ^ max(0, attempt - 1)`.
    pub fn delay_ms(&self, attempt: u32) -> i64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_backoff_ms as f64 * self.base.powi(exponent);
        if delay.is_finite() && delay < i64::MAX as f64 {
            delay.round().max(0.0) as i64
        } else {
            i64::MAX
        }
    }

    /// Whether a failure that brought the error count to `error_count`
    /// may be retried.
    pub fn allows_retry(&self, error_count: u32) -> bool {
        error_count < self.max_attempts
    }
}

/// What the caller asked for on a single item. Both fields are optional so
/// the engine-level defaults can fill the gaps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub enabled: Option<bool>,
    pub behavior: Option<RetryBehavior>,
}

impl RetryPolicy {
    pub fn enabled() -> Self {
        Self {
            enabled: Some(true),
            behavior: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: Some(false),
            behavior: None,
        }
    }

    pub fn with_behavior(behavior: RetryBehavior) -> Self {
        Self {
            enabled: Some(true),
            behavior: Some(behavior),
        }
    }

    /// Resolve to `(retry_enabled, behavior)` with precedence
    /// per-item > engine default > built-in default.
    pub fn resolve(&self, retry_by_default: bool, default: RetryBehavior) -> (bool, RetryBehavior) {
        let behavior = self.behavior.unwrap_or(default);
        let enabled = self.enabled.unwrap_or(retry_by_default);
        (enabled, behavior)
    }
}
