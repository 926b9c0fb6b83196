//! Configuration for the routing core.
//!
//! All knobs are plain struct fields with defaults matching the documented
//! behavior; embedding applications load them from whatever config surface
//! they own and pass the struct in at construction.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::{AgentId, TenantTier};

/// Configuration for the routing core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Maximum members in a single batch job
    pub max_batch_size: usize,

    /// Minimum members required to schedule a batch when its wait window
    /// elapses; smaller batches are dispatched individually
    pub min_batch_size: usize,

    /// Base wait window for a forming batch in milliseconds, scaled down by
    /// member priority (urgent 10%, high 30%, medium 70%, low 100%)
    pub max_wait_time_ms: u64,

    /// How often the batcher checks forming batches for elapsed windows
    pub batch_flush_interval_ms: u64,

    /// Maximum batch jobs executing concurrently
    pub concurrency_limit: usize,

    /// Maximum backoff retries against a single backend
    pub max_retries: u32,

    /// Base retry delay in milliseconds (exponentially increased)
    pub base_retry_delay_ms: u64,

    /// Ceiling on the computed retry delay in milliseconds
    pub max_retry_delay_ms: u64,

    /// Apply ±10% jitter to retry delays
    pub retry_jitter: bool,

    /// Failures within the breaker window before a backend's circuit opens
    pub breaker_threshold: u32,

    /// Rolling window over which breaker failures are counted, milliseconds
    pub breaker_window_ms: u64,

    /// How long an open circuit stays open before allowing a probe, milliseconds
    pub breaker_timeout_ms: u64,

    /// TTL for cached responses in seconds
    pub cache_ttl_secs: u64,

    /// Escalate to the routing decision's fallback chain on failure
    pub fallback_enabled: bool,

    /// Allow synthetic degraded responses when recovery is exhausted
    /// (still subject to per-tenant policy)
    pub degradation_enabled: bool,

    /// Return the constant emergency payload as the very last resort instead
    /// of surfacing a terminal error
    pub emergency_response_enabled: bool,

    /// Agent to try first during fallback routing when every strategy fails
    pub emergency_agent: Option<AgentId>,

    /// Pending-work count above which new submissions are refused
    pub high_water: usize,

    /// Pending-work count below which submissions resume
    pub low_water: usize,

    /// Maximum content length in characters; longer content is truncated,
    /// content above twice this is rejected outright
    pub max_content_len: usize,

    /// Safety margin subtracted from the remaining deadline budget when
    /// computing a per-attempt timeout, milliseconds
    pub attempt_safety_margin_ms: u64,

    /// Capacity of the event bus broadcast channel
    pub event_capacity: usize,

    /// Capacity of the registry observation channel
    pub observation_capacity: usize,

    pub preprocessor: PreprocessorConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            min_batch_size: 3,
            max_wait_time_ms: 2000,
            batch_flush_interval_ms: 20,
            concurrency_limit: 10,
            max_retries: 3,
            base_retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            retry_jitter: true,
            breaker_threshold: 10,
            breaker_window_ms: 60_000,
            breaker_timeout_ms: 60_000,
            cache_ttl_secs: 86_400, // 24 hours
            fallback_enabled: true,
            degradation_enabled: true,
            emergency_response_enabled: false,
            emergency_agent: None,
            high_water: 1000,
            low_water: 200,
            max_content_len: 100_000,
            attempt_safety_margin_ms: 250,
            event_capacity: 1024,
            observation_capacity: 256,
            preprocessor: PreprocessorConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn breaker_window(&self) -> Duration {
        Duration::from_millis(self.breaker_window_ms)
    }

    pub fn breaker_timeout(&self) -> Duration {
        Duration::from_millis(self.breaker_timeout_ms)
    }

    pub fn attempt_safety_margin(&self) -> Duration {
        Duration::from_millis(self.attempt_safety_margin_ms)
    }
}

/// A named content-rejection rule applied during the safety pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyRule {
    pub name: String,
    /// Regex matched case-insensitively against normalized content.
    pub pattern: String,
}

impl SafetyRule {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
        }
    }
}

/// Knobs for the preprocessor stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessorConfig {
    /// Maximum number of request parameters
    pub max_parameters: usize,

    /// Maximum serialized length of a single parameter value, characters
    pub max_parameter_len: usize,

    /// Arrays inside parameter values are clamped to this many elements
    pub max_array_elements: usize,

    /// Content-rejection rules; tenants with a credential exemption skip them
    pub blocklist: Vec<SafetyRule>,

    /// Reject content where one token makes up more than this fraction of words
    pub spam_repeat_ratio: f64,

    /// Spam heuristic only applies above this word count
    pub spam_min_words: usize,

    /// Default per-input-token price used for cost estimation
    pub default_input_token_price: f64,

    /// Default per-output-token price used for cost estimation
    pub default_output_token_price: f64,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            max_parameters: 20,
            max_parameter_len: 10_000,
            max_array_elements: 100,
            blocklist: default_blocklist(),
            spam_repeat_ratio: 0.3,
            spam_min_words: 10,
            default_input_token_price: 0.000_002,
            default_output_token_price: 0.000_006,
        }
    }
}

/// Credential-shaped content rejected by default.
pub fn default_blocklist() -> Vec<SafetyRule> {
    vec![
        SafetyRule::new("password", r"password\s*[:=]\s*\S+"),
        SafetyRule::new("api_key", r"api[_-]?key\s*[:=]\s*\S+"),
        SafetyRule::new("token", r"token\s*[:=]\s*\S+"),
    ]
}

/// Per-tenant policy consulted by the preprocessor, router, and recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantPolicy {
    pub tier: TenantTier,
    /// Permit synthetic degraded responses for this tenant
    pub allow_degradation: bool,
    /// Skip the credential blocklist for this tenant
    pub allow_credentials: bool,
}

impl Default for TenantPolicy {
    fn default() -> Self {
        Self {
            tier: TenantTier::Free,
            allow_degradation: true,
            allow_credentials: false,
        }
    }
}

/// Lookup of tenant policies; unknown tenants get the default policy.
#[derive(Debug, Default)]
pub struct TenantPolicies {
    policies: DashMap<String, TenantPolicy>,
}

impl TenantPolicies {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, tenant_id: impl Into<String>, policy: TenantPolicy) {
        self.policies.insert(tenant_id.into(), policy);
    }

    pub fn get(&self, tenant_id: &str) -> TenantPolicy {
        self.policies
            .get(tenant_id)
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn remove(&self, tenant_id: &str) {
        self.policies.remove(tenant_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.max_batch_size, 50);
        assert_eq!(config.min_batch_size, 3);
        assert_eq!(config.max_wait_time_ms, 2000);
        assert_eq!(config.concurrency_limit, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.breaker_threshold, 10);
        assert_eq!(config.breaker_timeout_ms, 60_000);
        assert_eq!(config.cache_ttl_secs, 86_400);
        assert!(!config.emergency_response_enabled);
    }

    #[test]
    fn test_unknown_tenant_gets_default_policy() {
        let policies = TenantPolicies::new();
        let policy = policies.get("nobody");
        assert_eq!(policy.tier, TenantTier::Free);
        assert!(policy.allow_degradation);
        assert!(!policy.allow_credentials);
    }

    #[test]
    fn test_tenant_policy_round_trip() {
        let policies = TenantPolicies::new();
        policies.set(
            "acme",
            TenantPolicy {
                tier: TenantTier::Enterprise,
                allow_degradation: false,
                allow_credentials: true,
            },
        );
        let policy = policies.get("acme");
        assert_eq!(policy.tier, TenantTier::Enterprise);
        assert!(!policy.allow_degradation);

        policies.remove("acme");
        assert_eq!(policies.get("acme").tier, TenantTier::Free);
    }

    #[test]
    fn test_default_blocklist_covers_credentials() {
        let rules = default_blocklist();
        let names: Vec<_> = rules.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"password"));
        assert!(names.contains(&"api_key"));
        assert!(names.contains(&"token"));
    }
}
