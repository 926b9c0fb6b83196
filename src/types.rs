//! Core data model: requests, derived request metadata, responses, and the
//! identifiers that tie them together.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// A unique identifier for a request in the routing core.
///
/// Uses a short, readable format like "req_abc123xy" instead of full UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Create a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Convert to a short, readable string format.
    ///
    /// Takes the first 8 hex characters of the UUID and formats as "req_xxxxxxxx".
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:032x}", self.0.as_u128());
        format!("req_{}", &hex[..8])
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<RequestId> for Uuid {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// Identifier of a routable backend (provider or agent).
///
/// Agent IDs are operator-assigned strings like "hosted-a/gpt-large" or
/// "local/embedder", stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = format!("{:032x}", self.0.as_u128());
        write!(f, "bat_{}", &hex[..8])
    }
}

/// Caller-supplied priority of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Numeric starting point for effective-priority resolution.
    pub fn base_score(&self) -> u8 {
        match self {
            Priority::Low => 2,
            Priority::Medium => 4,
            Priority::High => 6,
            Priority::Urgent => 8,
        }
    }

    /// Fraction of the base batching wait window this priority tolerates.
    pub fn wait_scale(&self) -> f64 {
        match self {
            Priority::Urgent => 0.1,
            Priority::High => 0.3,
            Priority::Medium => 0.7,
            Priority::Low => 1.0,
        }
    }
}

/// The kind of work a request asks for.
///
/// Drives capability matching, batching compatibility, cacheability, and the
/// risk/priority heuristics in the preprocessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Text,
    Chat,
    Code,
    Analysis,
    Multimodal,
    Embedding,
    Documentation,
    Explanation,
    Realtime,
    SpecializedTask,
    CodeExecution,
    FileAccess,
    NetworkRequest,
}

impl RequestType {
    /// Stable wire name, doubling as the default capability key for matching.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Text => "text",
            RequestType::Chat => "chat",
            RequestType::Code => "code",
            RequestType::Analysis => "analysis",
            RequestType::Multimodal => "multimodal",
            RequestType::Embedding => "embedding",
            RequestType::Documentation => "documentation",
            RequestType::Explanation => "explanation",
            RequestType::Realtime => "realtime",
            RequestType::SpecializedTask => "specialized_task",
            RequestType::CodeExecution => "code_execution",
            RequestType::FileAccess => "file_access",
            RequestType::NetworkRequest => "network_request",
        }
    }

    /// Types that touch execution or I/O surfaces and score extra risk.
    pub fn is_high_risk(&self) -> bool {
        matches!(
            self,
            RequestType::CodeExecution | RequestType::FileAccess | RequestType::NetworkRequest
        )
    }

    /// Types that get a latency-driven priority bump.
    pub fn is_latency_critical(&self) -> bool {
        matches!(self, RequestType::Realtime)
    }

    /// Types best served by a specialized agent rather than a generic provider.
    pub fn wants_specialist(&self) -> bool {
        matches!(
            self,
            RequestType::Code | RequestType::Analysis | RequestType::SpecializedTask
        )
    }

    /// Types whose responses carry fenced code blocks worth normalizing.
    pub fn is_markdownish(&self) -> bool {
        matches!(
            self,
            RequestType::Code | RequestType::Documentation | RequestType::Explanation
        )
    }

    /// Types with deterministic output, eligible for fingerprint caching.
    pub fn is_deterministic(&self) -> bool {
        matches!(
            self,
            RequestType::Text
                | RequestType::Code
                | RequestType::Analysis
                | RequestType::Embedding
                | RequestType::Documentation
                | RequestType::Explanation
        )
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tenant subscription tier, used for priority bonuses and cost routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TenantTier {
    #[default]
    Free,
    Plus,
    Pro,
    Enterprise,
}

impl TenantTier {
    pub fn priority_bonus(&self) -> u8 {
        match self {
            TenantTier::Free => 0,
            TenantTier::Plus => 1,
            TenantTier::Pro => 2,
            TenantTier::Enterprise => 3,
        }
    }
}

/// A typed attachment for multimodal requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// MIME type of the payload (e.g. "image/png").
    pub content_type: String,
    /// Base64-encoded payload or a resolvable URI, provider-dependent.
    pub data: String,
}

/// Caller routing preferences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    /// Pin routing to a specific backend when it is routable.
    pub preferred_agent: Option<AgentId>,
    /// Upper bound on the estimated cost of serving this request.
    pub max_cost: Option<f64>,
    /// Requested response format, passed through to the provider.
    pub response_format: Option<String>,
}

/// A request as accepted at submission. Immutable once normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub kind: RequestType,
    /// Normalized request content.
    pub content: String,
    pub attachments: Vec<Attachment>,
    /// Bounded key→value map; provider-specific keys pass through opaquely.
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub priority: Priority,
    /// Absolute deadline; the request times out at any stage boundary past it.
    pub deadline: DateTime<Utc>,
    pub required_capabilities: BTreeSet<String>,
    pub preferences: Preferences,
    pub submitted_at: DateTime<Utc>,
}

impl Request {
    /// Build a request with sensible defaults for everything but the content.
    ///
    /// The deadline defaults to 60 seconds out; callers with tighter budgets
    /// should set it explicitly.
    pub fn new(tenant_id: impl Into<String>, kind: RequestType, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RequestId::new(),
            tenant_id: tenant_id.into(),
            user_id: None,
            session_id: None,
            kind,
            content: content.into(),
            attachments: Vec::new(),
            parameters: BTreeMap::new(),
            priority: Priority::Medium,
            deadline: now + chrono::Duration::seconds(60),
            required_capabilities: BTreeSet::new(),
            preferences: Preferences::default(),
            submitted_at: now,
        }
    }

    /// Remaining time budget until the deadline, if any.
    pub fn remaining_budget(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        (self.deadline - now).to_std().ok()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }
}

/// Content-addressed hash of a normalized request, used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Estimated token counts for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEstimate {
    pub input: u64,
    pub output: u64,
}

/// Observed token usage and cost of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

/// A request annotated with everything the preprocessor derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessedRequest {
    pub request: Request,
    /// Heuristic risk score in [0, 10].
    pub risk_score: u8,
    /// Resolved scheduling priority in [1, 10].
    pub effective_priority: u8,
    pub estimated_tokens: TokenEstimate,
    pub estimated_cost: f64,
    /// Ordered record of normalizations applied to the content/parameters.
    pub transformations: Vec<String>,
    pub fingerprint: Fingerprint,
    pub validation_passed: bool,
}

impl PreprocessedRequest {
    pub fn id(&self) -> RequestId {
        self.request.id
    }
}

/// How a routing decision was reached and where to escalate on failure.
///
/// Immutable once issued; retry escalation produces a new decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub request_id: RequestId,
    pub agent_id: AgentId,
    pub strategy: String,
    /// Up to three alternatives for the executor to escalate to, in order.
    pub fallback_chain: Vec<AgentId>,
    pub reason: String,
    pub score_breakdown: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
}

/// Terminal classification of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    FatalFailure,
    Cancelled,
    Timeout,
}

/// Record of one attempt against one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub request_id: RequestId,
    /// 1-based attempt number across all agents tried for this request.
    pub attempt: u32,
    pub agent_id: AgentId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: AttemptOutcome,
    pub usage: Usage,
    pub error_kind: Option<ErrorKind>,
}

impl ExecutionAttempt {
    pub fn latency_ms(&self) -> Option<f64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as f64)
    }
}

/// Kind tag on a streamed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Content,
    Metadata,
    Error,
    Done,
}

/// One unit of a streaming response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub kind: ChunkKind,
    pub data: String,
}

impl StreamChunk {
    pub fn content(data: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Content,
            data: data.into(),
        }
    }

    pub fn metadata(data: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Metadata,
            data: data.into(),
        }
    }

    pub fn error(data: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Error,
            data: data.into(),
        }
    }

    pub fn done() -> Self {
        Self {
            kind: ChunkKind::Done,
            data: String::new(),
        }
    }
}

/// The terminal product of the pipeline for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedResponse {
    pub request_id: RequestId,
    pub success: bool,
    pub content: String,
    pub warnings: Vec<String>,
    /// Heuristic quality score in [0, 10].
    pub quality_score: f64,
    pub usage: Usage,
    pub transformations: Vec<String>,
    pub streaming: bool,
    pub cached: bool,
    /// True when the content is synthetic or reduced-quality.
    pub degraded: bool,
    pub produced_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_short_string() {
        let id = RequestId::new();
        let short = id.to_short_string();
        assert!(short.starts_with("req_"));
        assert_eq!(short.len(), 12);
    }

    #[test]
    fn test_batch_id_display() {
        let id = BatchId::new();
        assert!(id.to_string().starts_with("bat_"));
    }

    #[test]
    fn test_priority_base_scores_are_ordered() {
        assert!(Priority::Low.base_score() < Priority::Medium.base_score());
        assert!(Priority::Medium.base_score() < Priority::High.base_score());
        assert!(Priority::High.base_score() < Priority::Urgent.base_score());
    }

    #[test]
    fn test_wait_scale_shrinks_with_priority() {
        assert!(Priority::Urgent.wait_scale() < Priority::High.wait_scale());
        assert!(Priority::High.wait_scale() < Priority::Medium.wait_scale());
        assert!(Priority::Medium.wait_scale() < Priority::Low.wait_scale());
    }

    #[test]
    fn test_high_risk_types() {
        assert!(RequestType::CodeExecution.is_high_risk());
        assert!(RequestType::FileAccess.is_high_risk());
        assert!(RequestType::NetworkRequest.is_high_risk());
        assert!(!RequestType::Text.is_high_risk());
        assert!(!RequestType::Chat.is_high_risk());
    }

    #[test]
    fn test_deterministic_types_exclude_session_bound_kinds() {
        assert!(RequestType::Embedding.is_deterministic());
        assert!(RequestType::Text.is_deterministic());
        assert!(!RequestType::Chat.is_deterministic());
        assert!(!RequestType::Multimodal.is_deterministic());
    }

    #[test]
    fn test_request_deadline_budget() {
        let mut request = Request::new("acme", RequestType::Text, "hello");
        let now = Utc::now();
        assert!(!request.is_expired(now));
        assert!(request.remaining_budget(now).is_some());

        request.deadline = now - chrono::Duration::seconds(1);
        assert!(request.is_expired(now));
        assert!(request.remaining_budget(now).is_none());
    }

    #[test]
    fn test_type_wire_names_round_trip() {
        let kinds = [
            RequestType::Text,
            RequestType::CodeExecution,
            RequestType::SpecializedTask,
        ];
        for kind in kinds {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let back: RequestType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }
}
