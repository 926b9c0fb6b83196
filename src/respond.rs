//! Response transformation and quality scoring.
//!
//! Raw backend output passes through an ordered transformation pipeline
//! (safety redaction, formatting, markdown normalization, performance
//! annotation), gets a heuristic quality score, and becomes the terminal
//! `ProcessedResponse`. Streaming responses are accumulated upstream and run
//! through the same pipeline with the `streaming` flag set.

use std::sync::Arc;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde_json::json;

use crate::events::{EventBus, EventKind};
use crate::provider::RawResult;
use crate::types::{AgentId, PreprocessedRequest, ProcessedResponse, Usage};

static CREDENTIAL_SHAPES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)password\s*[:=]\s*\S+",
        r"(?i)api[_-]?key\s*[:=]\s*\S+",
        r"(?i)token\s*[:=]\s*\S+",
        r"(?i)bearer\s+[A-Za-z0-9._\-]{16,}",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static FENCE_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^```[ \t]*([A-Za-z0-9_+#.\-]+)[ \t]*$").unwrap());

static EXCESS_BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

const ERROR_KEYWORDS: &[&str] = &[
    "error:",
    "failed to",
    "unable to",
    "cannot process",
    "internal error",
    "exception",
];

/// Pluggable response quality scoring.
pub trait QualityScorer: Send + Sync {
    /// Score a response in [0, 10].
    fn score(&self, content: &str, prep: &PreprocessedRequest, elapsed_ms: f64) -> f64;
}

/// The default heuristic scorer.
///
/// Base 5, plus length-ratio and keyword-overlap terms, a bonus for coherent
/// termination, a penalty for error-looking output, and a small latency term.
pub struct HeuristicScorer;

impl QualityScorer for HeuristicScorer {
    fn score(&self, content: &str, prep: &PreprocessedRequest, elapsed_ms: f64) -> f64 {
        let mut score = 5.0;

        let request_chars = prep.request.content.chars().count().max(1) as f64;
        let response_chars = content.chars().count() as f64;
        let ratio = response_chars / request_chars;
        if (0.5..=2.0).contains(&ratio) {
            score += 2.0;
        } else if (0.1..=3.0).contains(&ratio) {
            score += 1.0;
        }

        score += 2.0 * keyword_overlap(&prep.request.content, content);

        let trimmed = content.trim_end();
        if trimmed.ends_with(['.', '!', '?']) || trimmed.ends_with("```") {
            score += 1.0;
        }

        let lowered = content.to_lowercase();
        if ERROR_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            score -= 2.0;
        }

        if elapsed_ms < 1000.0 {
            score += 0.5;
        } else if elapsed_ms > 10_000.0 {
            score -= 0.5;
        }

        score.clamp(0.0, 10.0)
    }
}

/// Fraction of the request's significant words that reappear in the response.
fn keyword_overlap(request: &str, response: &str) -> f64 {
    let significant = |s: &str| {
        s.split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|w| w.chars().count() > 3)
            .collect::<std::collections::BTreeSet<String>>()
    };
    let wanted = significant(request);
    if wanted.is_empty() {
        return 0.0;
    }
    let got = significant(response);
    let hits = wanted.intersection(&got).count();
    hits as f64 / wanted.len() as f64
}

/// Execution facts the processor needs alongside the raw result.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub agent_id: Option<AgentId>,
    pub attempts: u32,
    pub degraded: bool,
    pub streaming: bool,
    pub elapsed_ms: f64,
}

/// Final pipeline stage. See module docs.
pub struct ResponseProcessor {
    scorer: Arc<dyn QualityScorer>,
    bus: Arc<EventBus>,
}

impl ResponseProcessor {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Self::with_scorer(bus, Arc::new(HeuristicScorer))
    }

    pub fn with_scorer(bus: Arc<EventBus>, scorer: Arc<dyn QualityScorer>) -> Arc<Self> {
        Arc::new(Self { scorer, bus })
    }

    /// Transform a raw result into the terminal response.
    #[tracing::instrument(skip_all, fields(request_id = %prep.id()))]
    pub fn process(
        &self,
        raw: RawResult,
        prep: &PreprocessedRequest,
        meta: &ResponseMeta,
    ) -> ProcessedResponse {
        let mut content = raw.content;
        let mut transformations = Vec::new();
        let mut warnings = Vec::new();

        // priority 20: redact credential-shaped strings
        let redacted = redact_credentials(&content);
        if redacted != content {
            content = redacted;
            transformations.push("safety_filter".to_string());
            warnings.push("sensitive content was redacted from the response".to_string());
        }

        // priority 10: whitespace and blank-line normalization
        let formatted = format_content(&content);
        if formatted != content {
            content = formatted;
            transformations.push("content_formatting".to_string());
        }

        // priority 5: fenced-code-block hints for markdown-ish request types
        if prep.request.kind.is_markdownish() {
            let enhanced = normalize_fence_hints(&content);
            if enhanced != content {
                content = enhanced;
                transformations.push("markdown_enhancement".to_string());
            }
        }

        // priority 1: performance annotation (observability only)
        let words = content.split_whitespace().count();
        let lines = content.lines().count();
        metrics::histogram!("conflux_response_chars").record(content.chars().count() as f64);
        metrics::histogram!("conflux_response_words").record(words as f64);
        metrics::histogram!("conflux_response_lines").record(lines as f64);
        metrics::histogram!("conflux_request_latency_ms").record(meta.elapsed_ms);
        transformations.push("performance_metrics".to_string());

        let mut quality_score = self.scorer.score(&content, prep, meta.elapsed_ms);
        if meta.degraded {
            quality_score = quality_score.min(5.0);
            warnings.push(
                "this is a degraded response; content is synthetic or reduced quality"
                    .to_string(),
            );
        }

        let usage = raw.usage.unwrap_or_else(|| Usage {
            input_tokens: prep.estimated_tokens.input,
            output_tokens: (content.chars().count() as u64).div_ceil(4),
            cost: prep.estimated_cost,
        });

        let response = ProcessedResponse {
            request_id: prep.id(),
            success: true,
            content,
            warnings,
            quality_score,
            usage,
            transformations,
            streaming: meta.streaming,
            cached: false,
            degraded: meta.degraded,
            produced_at: Utc::now(),
        };

        self.bus.publish(
            EventKind::ResponseProcessed,
            Some(prep.id()),
            json!({
                "agent_id": meta.agent_id,
                "attempts": meta.attempts,
                "quality_score": response.quality_score,
                "degraded": response.degraded,
                "streaming": response.streaming,
            }),
        );
        if meta.degraded {
            self.bus.publish(
                EventKind::ResponseDegraded,
                Some(prep.id()),
                json!({"attempts": meta.attempts}),
            );
        }

        response
    }
}

fn redact_credentials(content: &str) -> String {
    let mut out = content.to_string();
    for pattern in CREDENTIAL_SHAPES.iter() {
        out = pattern.replace_all(&out, "[redacted]").into_owned();
    }
    out
}

/// Trim trailing whitespace per line, collapse runs of blank lines, trim ends.
fn format_content(content: &str) -> String {
    let stripped: String = content
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    EXCESS_BLANK_LINES
        .replace_all(&stripped, "\n\n")
        .trim()
        .to_string()
}

/// Lowercase fenced-code-block language hints (```Rust → ```rust).
fn normalize_fence_hints(content: &str) -> String {
    FENCE_HINT
        .replace_all(content, |caps: &regex::Captures<'_>| {
            format!("```{}", caps[1].to_lowercase())
        })
        .into_owned()
}
