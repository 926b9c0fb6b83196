//! Recovery policies: retry backoff, error-pattern tracking, and the
//! synthetic responses used when every backend is exhausted.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;

use crate::config::CoreConfig;
use crate::provider::RawResult;
use crate::types::PreprocessedRequest;

/// Support contact carried by the emergency payload.
const SUPPORT_CONTACT: &str = "support@conflux.dev";

/// Exponential backoff policy for retryable failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub factor: u32,
    pub max: Duration,
    pub jitter: bool,
}

impl From<&CoreConfig> for RetryPolicy {
    fn from(config: &CoreConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: Duration::from_millis(config.base_retry_delay_ms),
            factor: 2,
            max: Duration::from_millis(config.max_retry_delay_ms),
            jitter: config.retry_jitter,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based): `min(base·factor^(n−1), max)`,
    /// with optional ±10% jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let multiplier = self.factor.saturating_pow(exponent);
        let raw = self
            .base
            .checked_mul(multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        if !self.jitter {
            return raw;
        }
        let factor = rand::rng().random_range(0.9..1.1);
        raw.mul_f64(factor)
    }
}

/// One observed `(error kind, backend)` failure pattern.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPattern {
    pub error_kind: String,
    pub backend_key: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

/// In-memory index of failure patterns, keyed by `(errorKind, backendKey)`.
///
/// Consulted by degradation heuristics and exported for operators.
#[derive(Default)]
pub struct ErrorPatterns {
    patterns: DashMap<(String, String), (u64, DateTime<Utc>)>,
}

impl ErrorPatterns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, error_kind: &str, backend_key: &str) {
        let mut entry = self
            .patterns
            .entry((error_kind.to_string(), backend_key.to_string()))
            .or_insert((0, Utc::now()));
        entry.0 += 1;
        entry.1 = Utc::now();
    }

    /// Snapshot of all patterns, most frequent first.
    pub fn snapshot(&self) -> Vec<ErrorPattern> {
        let mut out: Vec<_> = self
            .patterns
            .iter()
            .map(|entry| {
                let ((error_kind, backend_key), (count, last_seen)) =
                    (entry.key().clone(), *entry.value());
                ErrorPattern {
                    error_kind,
                    backend_key,
                    count,
                    last_seen,
                }
            })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count));
        out
    }

    pub fn count_for(&self, error_kind: &str, backend_key: &str) -> u64 {
        self.patterns
            .get(&(error_kind.to_string(), backend_key.to_string()))
            .map(|e| e.0)
            .unwrap_or(0)
    }
}

/// Synthetic reduced-quality response used when recovery falls through to
/// graceful degradation.
pub fn degraded_result(prep: &PreprocessedRequest) -> RawResult {
    RawResult::text(format!(
        "The {} backends for this request are currently unavailable. \
         This is an automatically generated placeholder of reduced quality; \
         please retry shortly for a full response.",
        prep.request.kind
    ))
}

/// Constant last-resort payload.
pub fn emergency_result() -> RawResult {
    let payload = serde_json::json!({
        "status": "service_unavailable",
        "message": "All backends are currently unavailable. Please retry later.",
        "support": SUPPORT_CONTACT,
    });
    RawResult::text(payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(1000),
            factor: 2,
            max: Duration::from_millis(30_000),
            jitter,
        }
    }

    #[test]
    fn test_backoff_doubles_per_retry() {
        let policy = policy(false);
        assert_eq!(policy.delay(1).as_millis(), 1000);
        assert_eq!(policy.delay(2).as_millis(), 2000);
        assert_eq!(policy.delay(3).as_millis(), 4000);
        assert_eq!(policy.delay(4).as_millis(), 8000);
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let policy = policy(false);
        assert_eq!(policy.delay(10).as_millis(), 30_000);
        // large retry counts must not overflow
        assert_eq!(policy.delay(64).as_millis(), 30_000);
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let policy = policy(true);
        for _ in 0..50 {
            let delay = policy.delay(1).as_millis();
            assert!((900..1100).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn test_error_patterns_accumulate() {
        let patterns = ErrorPatterns::new();
        patterns.record("timeout", "hosted-a");
        patterns.record("timeout", "hosted-a");
        patterns.record("fatal_server", "hosted-b");

        assert_eq!(patterns.count_for("timeout", "hosted-a"), 2);
        assert_eq!(patterns.count_for("fatal_server", "hosted-b"), 1);
        assert_eq!(patterns.count_for("timeout", "hosted-b"), 0);

        let snapshot = patterns.snapshot();
        assert_eq!(snapshot[0].error_kind, "timeout");
        assert_eq!(snapshot[0].count, 2);
    }

    #[test]
    fn test_emergency_payload_is_stable() {
        let a = emergency_result();
        let b = emergency_result();
        assert_eq!(a.content, b.content);
        assert!(a.content.contains("service_unavailable"));
        assert!(a.content.contains(SUPPORT_CONTACT));
    }
}
