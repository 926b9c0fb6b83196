//! Request validation, normalization, and enrichment.
//!
//! The preprocessor is the first pipeline stage: it rejects malformed or
//! unsafe requests, normalizes content and parameters, derives risk and
//! scheduling priority, estimates token usage and cost, and fingerprints the
//! result for caching.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::config::{PreprocessorConfig, TenantPolicies, TenantPolicy};
use crate::error::{CoreError, Result};
use crate::events::{EventBus, EventKind};
use crate::types::{Fingerprint, PreprocessedRequest, Request, TokenEstimate};

/// Appended to content cut at the length ceiling.
const TRUNCATION_MARKER: &str = "… [truncated]";

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script>").unwrap());

/// First pipeline stage. See module docs.
pub struct Preprocessor {
    config: PreprocessorConfig,
    max_content_len: usize,
    policies: Arc<TenantPolicies>,
    bus: Arc<EventBus>,
    blocklist: Vec<(String, Regex)>,
}

impl Preprocessor {
    pub fn new(
        config: PreprocessorConfig,
        max_content_len: usize,
        policies: Arc<TenantPolicies>,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let mut blocklist = Vec::with_capacity(config.blocklist.len());
        for rule in &config.blocklist {
            let compiled = Regex::new(&format!("(?i){}", rule.pattern)).map_err(|e| {
                CoreError::Internal(anyhow::anyhow!(
                    "invalid safety rule '{}': {e}",
                    rule.name
                ))
            })?;
            blocklist.push((rule.name.clone(), compiled));
        }
        Ok(Self {
            config,
            max_content_len,
            policies,
            bus,
            blocklist,
        })
    }

    /// Validate and normalize a request, deriving the routing metadata.
    ///
    /// Fails with `Validation` for malformed input and `PolicyRejection` when
    /// the safety pass fires.
    #[tracing::instrument(skip(self, request), fields(request_id = %request.id))]
    pub fn preprocess(&self, request: Request) -> Result<PreprocessedRequest> {
        match self.run(request) {
            Ok(prep) => {
                self.bus.publish(
                    EventKind::RequestPreprocessed,
                    Some(prep.id()),
                    json!({
                        "risk_score": prep.risk_score,
                        "effective_priority": prep.effective_priority,
                        "estimated_cost": prep.estimated_cost,
                    }),
                );
                metrics::counter!("conflux_requests_preprocessed_total").increment(1);
                Ok(prep)
            }
            Err((id, error)) => {
                self.bus.publish(
                    EventKind::RequestRejected,
                    Some(id),
                    json!({"reason": error.to_string(), "kind": error.tag()}),
                );
                metrics::counter!("conflux_requests_rejected_total", "kind" => error.tag())
                    .increment(1);
                Err(error)
            }
        }
    }

    fn run(
        &self,
        mut request: Request,
    ) -> std::result::Result<PreprocessedRequest, (crate::types::RequestId, CoreError)> {
        let id = request.id;
        let fail = |e: CoreError| (id, e);
        let mut transformations = Vec::new();

        // Schema validation. The hard content ceiling is twice the truncation
        // threshold; anything between is truncated below.
        let raw_chars = request.content.chars().count();
        if request.content.trim().is_empty() {
            return Err(fail(CoreError::Validation("content is empty".into())));
        }
        if raw_chars > self.max_content_len * 2 {
            return Err(fail(CoreError::Validation(format!(
                "content length {raw_chars} exceeds hard limit {}",
                self.max_content_len * 2
            ))));
        }
        if request.parameters.len() > self.config.max_parameters {
            return Err(fail(CoreError::Validation(format!(
                "too many parameters: {} > {}",
                request.parameters.len(),
                self.config.max_parameters
            ))));
        }
        if request.deadline <= Utc::now() {
            return Err(fail(CoreError::Validation(
                "deadline must be in the future".into(),
            )));
        }

        // Content normalization.
        let normalized = normalize_content(&request.content);
        if normalized.is_empty() {
            return Err(fail(CoreError::Validation(
                "content is empty after normalization".into(),
            )));
        }
        if normalized != request.content {
            transformations.push("content_normalization".to_string());
        }
        request.content = normalized;

        let original_length = request.content.chars().count();
        if original_length > self.max_content_len {
            let keep = self.max_content_len.saturating_sub(12);
            let mut truncated: String = request.content.chars().take(keep).collect();
            truncated.push_str(TRUNCATION_MARKER);
            request.content = truncated;
            transformations.push(format!("truncation(original_length={original_length})"));
        }

        // Parameter sanitization.
        let (parameters, params_changed) =
            sanitize_parameters(std::mem::take(&mut request.parameters), &self.config);
        for (key, value) in &parameters {
            let serialized_len = value.to_string().chars().count();
            if serialized_len > self.config.max_parameter_len {
                return Err(fail(CoreError::Validation(format!(
                    "parameter '{key}' serializes to {serialized_len} chars, limit {}",
                    self.config.max_parameter_len
                ))));
            }
        }
        if params_changed {
            transformations.push("parameter_sanitization".to_string());
        }
        request.parameters = parameters;

        // Safety pass.
        let policy = self.policies.get(&request.tenant_id);
        if !policy.allow_credentials {
            for (name, pattern) in &self.blocklist {
                if pattern.is_match(&request.content) {
                    return Err(fail(CoreError::PolicyRejection(format!(
                        "content matched safety rule '{name}'"
                    ))));
                }
            }
        }
        if let Some(ratio) = dominant_token_ratio(&request.content, self.config.spam_min_words) {
            if ratio > self.config.spam_repeat_ratio {
                return Err(fail(CoreError::PolicyRejection(
                    "repetitive content".into(),
                )));
            }
        }

        let risk_score = self.risk_score(&request);
        let effective_priority = self.effective_priority(&request, &policy);

        // Token and cost estimation.
        let content_chars = request.content.chars().count() as u64;
        let input = content_chars.div_ceil(4);
        let output = ((input as f64 * 0.3) as u64).clamp(100, 4000);
        let estimated_tokens = TokenEstimate { input, output };
        let estimated_cost = input as f64 * self.config.default_input_token_price
            + output as f64 * self.config.default_output_token_price;

        let fingerprint = fingerprint(&request);

        Ok(PreprocessedRequest {
            request,
            risk_score,
            effective_priority,
            estimated_tokens,
            estimated_cost,
            transformations,
            fingerprint,
            validation_passed: true,
        })
    }

    fn risk_score(&self, request: &Request) -> u8 {
        let mut score = 0u8;
        // the size bands stack: content above 50k chars takes both
        let chars = request.content.chars().count();
        if chars > 50_000 {
            score += 2;
        }
        if chars > 10_000 {
            score += 1;
        }
        if request.parameters.len() > 20 {
            score += 2;
        }
        if request.kind.is_high_risk() {
            score += 3;
        }
        if request.user_id.is_none() {
            score += 1;
        }
        score.min(10)
    }

    fn effective_priority(&self, request: &Request, policy: &TenantPolicy) -> u8 {
        let mut priority = request.priority.base_score() + policy.tier.priority_bonus();
        if request.kind.is_latency_critical() {
            priority += 2;
        }
        priority.clamp(1, 10)
    }
}

/// Strip control characters, map all Unicode whitespace to ASCII space,
/// collapse runs, and trim. Idempotent.
pub fn normalize_content(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut pending_space = false;
    for c in content.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else if c.is_control() {
            // non-whitespace control characters are dropped outright
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
    }
    out
}

fn sanitize_parameters(
    parameters: BTreeMap<String, Value>,
    config: &PreprocessorConfig,
) -> (BTreeMap<String, Value>, bool) {
    let mut changed = false;
    let mut out = BTreeMap::new();
    for (key, value) in parameters {
        let normalized_key: String = key
            .to_lowercase()
            .chars()
            .map(|c| {
                if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if normalized_key != key {
            changed = true;
        }
        let sanitized = sanitize_value(value, config, &mut changed);
        out.insert(normalized_key, sanitized);
    }
    (out, changed)
}

fn sanitize_value(value: Value, config: &PreprocessorConfig, changed: &mut bool) -> Value {
    match value {
        Value::String(s) => {
            let stripped = SCRIPT_BLOCK.replace_all(&s, "");
            if stripped != s {
                *changed = true;
                Value::String(stripped.into_owned())
            } else {
                Value::String(s)
            }
        }
        Value::Array(items) => {
            let mut items = items;
            if items.len() > config.max_array_elements {
                items.truncate(config.max_array_elements);
                *changed = true;
            }
            Value::Array(
                items
                    .into_iter()
                    .map(|v| sanitize_value(v, config, changed))
                    .collect(),
            )
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, sanitize_value(v, config, changed)))
                .collect(),
        ),
        other => other,
    }
}

/// Fraction of words taken by the most repeated token, when the content is
/// long enough for the ratio to mean anything.
fn dominant_token_ratio(content: &str, min_words: usize) -> Option<f64> {
    let words: Vec<String> = content
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    if words.len() <= min_words {
        return None;
    }
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for word in &words {
        *counts.entry(word.as_str()).or_default() += 1;
    }
    let max = counts.values().copied().max().unwrap_or(0);
    Some(max as f64 / words.len() as f64)
}

/// Stable content-addressed hash over type, normalized content, and sorted
/// parameters.
pub fn fingerprint(request: &Request) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(request.kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(request.content.as_bytes());
    hasher.update([0u8]);
    // BTreeMap serializes with sorted keys, so this is order-stable.
    hasher.update(
        serde_json::to_string(&request.parameters)
            .unwrap_or_default()
            .as_bytes(),
    );
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Fingerprint::from_hex(hex)
}
