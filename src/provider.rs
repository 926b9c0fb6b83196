//! Backend plug-in contract.
//!
//! This module defines the `Provider` trait that every routable backend
//! implements, enabling testability with mock implementations. The core never
//! speaks a vendor wire protocol itself; it hands a `PreparedCall` to a
//! provider and consumes the tagged result.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::registry::HealthState;
use crate::types::{Attachment, RequestId, RequestType, StreamChunk, Usage};

/// The call a provider receives: normalized content plus opaque passthrough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedCall {
    pub request_id: RequestId,
    pub kind: RequestType,
    pub content: String,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub attachments: Vec<Attachment>,
    /// Requested ceiling on generated tokens, from the preprocessor estimate.
    pub max_output_tokens: u64,
    /// Caller-requested response format, if any.
    pub response_format: Option<String>,
}

/// What a provider returns on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    pub content: String,
    /// Usage as reported by the backend; estimated downstream when absent.
    pub usage: Option<Usage>,
    /// Backend-reported model identifier, if any.
    pub model: Option<String>,
}

impl RawResult {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
            model: None,
        }
    }
}

/// Result of a provider health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub latency_ms: Option<f64>,
    pub detail: Option<String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            state: HealthState::Healthy,
            latency_ms: None,
            detail: None,
        }
    }
}

/// Trait every routable backend implements.
///
/// Errors must be tagged with an [`crate::error::ErrorKind`] so recovery can
/// classify them; untagged surprises should map to `FatalServer`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Capability set with per-capability proficiency in [0, 1].
    fn capabilities(&self) -> BTreeMap<String, f64>;

    /// Execute a prepared call. The deadline is advisory; the executor also
    /// enforces a hard per-attempt timeout.
    async fn execute(
        &self,
        call: &PreparedCall,
        deadline: DateTime<Utc>,
    ) -> Result<RawResult, ProviderError>;

    /// Execute a prepared call, streaming chunks as they arrive.
    ///
    /// The default implementation wraps [`Provider::execute`] into a
    /// two-chunk stream for backends without native streaming.
    async fn execute_stream(
        &self,
        call: &PreparedCall,
        deadline: DateTime<Utc>,
    ) -> Result<BoxStream<'static, StreamChunk>, ProviderError> {
        let result = self.execute(call, deadline).await?;
        let chunks = vec![StreamChunk::content(result.content), StreamChunk::done()];
        Ok(futures::stream::iter(chunks).boxed())
    }

    /// Active health probe; registries may poll this out of band.
    async fn health_probe(&self) -> HealthReport {
        HealthReport::healthy()
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Mock provider for testing.
///
/// Scripted responses are returned in FIFO order; when the script is empty
/// the mock echoes the call content. Every call is recorded for assertions.
pub struct MockProvider {
    capabilities: BTreeMap<String, f64>,
    responses: Mutex<VecDeque<Result<RawResult, ProviderError>>>,
    calls: Mutex<Vec<PreparedCall>>,
    delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
}

impl MockProvider {
    /// Create a mock with a generic capability set.
    pub fn new() -> Self {
        let mut capabilities = BTreeMap::new();
        capabilities.insert("text".to_string(), 0.8);
        capabilities.insert("chat".to_string(), 0.8);
        Self {
            capabilities,
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replace the advertised capability set.
    pub fn with_capabilities<I, K>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        self.capabilities = caps.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self
    }

    /// Inject a fixed latency before every response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a scripted response; scripted responses win over the echo default.
    pub fn add_response(&self, response: Result<RawResult, ProviderError>) {
        self.responses.lock().push_back(response);
    }

    /// All calls made against this mock, in order.
    pub fn calls(&self) -> Vec<PreparedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls currently executing (useful for concurrency assertions).
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn capabilities(&self) -> BTreeMap<String, f64> {
        self.capabilities.clone()
    }

    async fn execute(
        &self,
        call: &PreparedCall,
        _deadline: DateTime<Utc>,
    ) -> Result<RawResult, ProviderError> {
        self.calls.lock().push(call.clone());
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let _guard = scopeguard::guard(self.in_flight.clone(), |counter| {
            counter.fetch_sub(1, Ordering::Relaxed);
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.responses.lock().pop_front();
        match scripted {
            Some(response) => response,
            None => Ok(RawResult::text(format!("ok: {}", call.content))),
        }
    }
}
