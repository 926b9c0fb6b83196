//! Backend invocation with retries, fallback escalation, circuit breaking,
//! and graceful degradation.
//!
//! The executor walks the routing decision's agent chain. Against each agent
//! it enforces a per-attempt timeout carved from the request's remaining
//! deadline budget, retries retryable failures with exponential backoff, and
//! consults the per-backend circuit breaker before every attempt. When the
//! chain is exhausted it degrades or surfaces the terminal classification.

pub mod breaker;
pub mod recovery;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::{CoreConfig, TenantPolicies};
use crate::error::{CoreError, ErrorKind, ProviderError, Result};
use crate::events::{EventBus, EventKind};
use crate::provider::{PreparedCall, Provider, RawResult};
use crate::registry::{AgentRegistry, Observation};
use crate::types::{
    AgentId, AttemptOutcome, ChunkKind, ExecutionAttempt, PreprocessedRequest, RoutingDecision,
    StreamChunk, Usage,
};

use breaker::BreakerMap;
use recovery::{ErrorPatterns, RetryPolicy, degraded_result, emergency_result};

/// An attempt is not worth starting with less budget than this.
const MIN_ATTEMPT_BUDGET: Duration = Duration::from_millis(10);

/// What execution produced for one request.
#[derive(Debug)]
pub struct ExecOutcome {
    pub raw: RawResult,
    /// The agent that produced the result; `None` for synthetic responses.
    pub agent_id: Option<AgentId>,
    /// Total attempts made across all agents.
    pub attempts: u32,
    pub degraded: bool,
    /// Whether content chunks were already forwarded to a streaming caller.
    pub streamed: bool,
    pub elapsed_ms: f64,
}

/// Invokes backends on behalf of the dispatcher.
pub struct Executor {
    registry: Arc<AgentRegistry>,
    breakers: Arc<BreakerMap>,
    retry: RetryPolicy,
    patterns: ErrorPatterns,
    policies: Arc<TenantPolicies>,
    bus: Arc<EventBus>,
    observations: mpsc::Sender<Observation>,
    fallback_enabled: bool,
    degradation_enabled: bool,
    emergency_response_enabled: bool,
    safety_margin: Duration,
}

impl Executor {
    pub fn new(
        config: &CoreConfig,
        registry: Arc<AgentRegistry>,
        breakers: Arc<BreakerMap>,
        policies: Arc<TenantPolicies>,
        bus: Arc<EventBus>,
        observations: mpsc::Sender<Observation>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            breakers,
            retry: RetryPolicy::from(config),
            patterns: ErrorPatterns::new(),
            policies,
            bus,
            observations,
            fallback_enabled: config.fallback_enabled,
            degradation_enabled: config.degradation_enabled,
            emergency_response_enabled: config.emergency_response_enabled,
            safety_margin: config.attempt_safety_margin(),
        })
    }

    /// Observed failure patterns, most frequent first.
    pub fn error_patterns(&self) -> Vec<recovery::ErrorPattern> {
        self.patterns.snapshot()
    }

    /// Execute one request against its routing decision.
    ///
    /// `cancelled` is polled between attempts; a cancelled request never
    /// starts another backend call.
    #[tracing::instrument(skip_all, fields(request_id = %prep.id(), agent_id = %decision.agent_id))]
    pub async fn execute(
        &self,
        prep: &PreprocessedRequest,
        decision: &RoutingDecision,
        cancelled: &AtomicBool,
        stream_tx: Option<&mpsc::Sender<StreamChunk>>,
    ) -> Result<ExecOutcome> {
        let overall_start = std::time::Instant::now();
        let call = prepared_call(prep);
        let chain = self.chain(decision);

        let mut attempt_no: u32 = 0;
        let mut last_error: Option<CoreError> = None;
        let mut forwarded_any = false;

        'agents: for agent_id in chain {
            let Some(snapshot) = self.registry.get(&agent_id) else {
                continue;
            };
            // offline or unhealthy agents are skipped, never called
            if !snapshot.available() {
                continue;
            }
            let Some(provider) = self.registry.provider(&agent_id) else {
                continue;
            };
            let key = agent_id.as_str().to_string();
            let mut retries_here: u32 = 0;

            loop {
                if cancelled.load(Ordering::Relaxed) {
                    return Err(CoreError::Cancelled);
                }
                let Some(remaining) = prep.request.remaining_budget(Utc::now()) else {
                    return Err(CoreError::TimeoutExceeded);
                };
                let budget = remaining.saturating_sub(self.safety_margin);
                if budget < MIN_ATTEMPT_BUDGET {
                    return Err(CoreError::TimeoutExceeded);
                }

                if let Err(refused) = self.breakers.preflight(&key) {
                    self.patterns.record("circuit_open", &key);
                    tracing::debug!(backend = %key, "Breaker refused attempt, escalating");
                    last_error = Some(refused);
                    continue 'agents;
                }

                attempt_no += 1;
                let started_at = Utc::now();
                self.bus.publish(
                    EventKind::AttemptStarted,
                    Some(prep.id()),
                    json!({"agent_id": agent_id, "attempt": attempt_no}),
                );
                let _inflight = self.registry.begin_attempt(&agent_id);

                let result = match stream_tx {
                    Some(tx) => {
                        self.attempt_stream(&provider, &call, prep, budget, tx, &mut forwarded_any)
                            .await
                    }
                    None => {
                        match tokio::time::timeout(
                            budget,
                            provider.execute(&call, prep.request.deadline),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(ProviderError::timeout("attempt timed out")),
                        }
                    }
                };
                let ended_at = Utc::now();

                match result {
                    Ok(raw) => {
                        self.breakers.record_success(&key);
                        let usage = raw.usage.unwrap_or_default();
                        self.record_attempt(ExecutionAttempt {
                            request_id: prep.id(),
                            attempt: attempt_no,
                            agent_id: agent_id.clone(),
                            started_at,
                            ended_at: Some(ended_at),
                            outcome: AttemptOutcome::Success,
                            usage,
                            error_kind: None,
                        });
                        self.bus.publish(
                            EventKind::AttemptSucceeded,
                            Some(prep.id()),
                            json!({
                                "agent_id": agent_id,
                                "attempt": attempt_no,
                                "latency_ms": (ended_at - started_at).num_milliseconds(),
                            }),
                        );
                        return Ok(ExecOutcome {
                            raw,
                            agent_id: Some(agent_id),
                            attempts: attempt_no,
                            degraded: false,
                            streamed: forwarded_any,
                            elapsed_ms: overall_start.elapsed().as_secs_f64() * 1000.0,
                        });
                    }
                    Err(provider_error) => {
                        let kind = provider_error.kind;
                        self.breakers
                            .record_failure(&key, kind.counts_against_breaker());
                        self.patterns.record(kind.as_str(), &key);
                        self.record_attempt(ExecutionAttempt {
                            request_id: prep.id(),
                            attempt: attempt_no,
                            agent_id: agent_id.clone(),
                            started_at,
                            ended_at: Some(ended_at),
                            outcome: if kind.is_retryable() {
                                AttemptOutcome::RetryableFailure
                            } else {
                                AttemptOutcome::FatalFailure
                            },
                            usage: Usage::default(),
                            error_kind: Some(kind),
                        });
                        self.bus.publish(
                            EventKind::AttemptFailed,
                            Some(prep.id()),
                            json!({
                                "agent_id": agent_id,
                                "attempt": attempt_no,
                                "error_kind": kind.as_str(),
                            }),
                        );
                        tracing::warn!(
                            backend = %key,
                            attempt = attempt_no,
                            error_kind = %kind,
                            error = %provider_error.message,
                            "Attempt failed"
                        );

                        // Once chunks reached the caller, a replay elsewhere
                        // would duplicate content; surface the interruption.
                        if forwarded_any {
                            return Err(CoreError::BackendFatal(format!(
                                "stream interrupted: {}",
                                provider_error.message
                            )));
                        }

                        match kind {
                            ErrorKind::FatalClient => {
                                return Err(CoreError::BackendFatal(provider_error.message));
                            }
                            kind if kind.is_retryable() => {
                                if retries_here < self.retry.max_retries {
                                    retries_here += 1;
                                    let delay = self.retry.delay(retries_here);
                                    let remaining = prep
                                        .request
                                        .remaining_budget(Utc::now())
                                        .unwrap_or(Duration::ZERO);
                                    if delay >= remaining {
                                        return Err(CoreError::TimeoutExceeded);
                                    }
                                    tracing::debug!(
                                        backend = %key,
                                        retry = retries_here,
                                        delay_ms = delay.as_millis() as u64,
                                        "Backing off before retry"
                                    );
                                    tokio::time::sleep(delay).await;
                                    continue;
                                }
                                last_error = Some(CoreError::RetriesExhausted {
                                    attempts: attempt_no,
                                    message: provider_error.message,
                                });
                                continue 'agents;
                            }
                            _ => {
                                last_error =
                                    Some(CoreError::BackendFatal(provider_error.message));
                                continue 'agents;
                            }
                        }
                    }
                }
            }
        }

        self.exhausted(prep, attempt_no, last_error, overall_start)
    }

    /// The chain was exhausted: degrade, return the emergency payload, or
    /// surface the terminal classification.
    fn exhausted(
        &self,
        prep: &PreprocessedRequest,
        attempts: u32,
        last_error: Option<CoreError>,
        overall_start: std::time::Instant,
    ) -> Result<ExecOutcome> {
        let policy = self.policies.get(&prep.request.tenant_id);
        if self.degradation_enabled && policy.allow_degradation {
            tracing::warn!(request_id = %prep.id(), "Recovery exhausted, degrading");
            metrics::counter!("conflux_degraded_responses_total").increment(1);
            return Ok(ExecOutcome {
                raw: degraded_result(prep),
                agent_id: None,
                attempts,
                degraded: true,
                streamed: false,
                elapsed_ms: overall_start.elapsed().as_secs_f64() * 1000.0,
            });
        }
        if self.emergency_response_enabled {
            tracing::warn!(request_id = %prep.id(), "Recovery exhausted, emergency response");
            metrics::counter!("conflux_emergency_responses_total").increment(1);
            return Ok(ExecOutcome {
                raw: emergency_result(),
                agent_id: None,
                attempts,
                degraded: true,
                streamed: false,
                elapsed_ms: overall_start.elapsed().as_secs_f64() * 1000.0,
            });
        }
        Err(last_error.unwrap_or(CoreError::NoAgentAvailable))
    }

    /// Ordered agents to try: the selection, then same-family fallbacks,
    /// then the rest of the chain.
    fn chain(&self, decision: &RoutingDecision) -> Vec<AgentId> {
        let mut out = vec![decision.agent_id.clone()];
        if !self.fallback_enabled {
            return out;
        }
        let family = self
            .registry
            .get(&decision.agent_id)
            .map(|s| s.backend.clone());
        let (same_family, other): (Vec<AgentId>, Vec<AgentId>) = decision
            .fallback_chain
            .iter()
            .cloned()
            .partition(|id| match (&family, self.registry.get(id)) {
                (Some(family), Some(snapshot)) => &snapshot.backend == family,
                _ => false,
            });
        out.extend(same_family);
        out.extend(other);
        out
    }

    async fn attempt_stream(
        &self,
        provider: &Arc<dyn Provider>,
        call: &PreparedCall,
        prep: &PreprocessedRequest,
        budget: Duration,
        tx: &mpsc::Sender<StreamChunk>,
        forwarded_any: &mut bool,
    ) -> std::result::Result<RawResult, ProviderError> {
        let attempt = async {
            let mut stream = provider.execute_stream(call, prep.request.deadline).await?;
            let mut content = String::new();
            while let Some(chunk) = stream.next().await {
                match chunk.kind {
                    ChunkKind::Content => {
                        content.push_str(&chunk.data);
                        *forwarded_any = true;
                        // a closed receiver means the caller stopped
                        // listening; keep accumulating for the final response
                        let _ = tx.send(chunk).await;
                    }
                    ChunkKind::Metadata => {
                        let _ = tx.send(chunk).await;
                    }
                    ChunkKind::Error => {
                        return Err(ProviderError::fatal_server(chunk.data));
                    }
                    ChunkKind::Done => break,
                }
            }
            Ok(RawResult {
                content,
                usage: None,
                model: None,
            })
        };

        match tokio::time::timeout(budget, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::timeout("attempt timed out")),
        }
    }

    fn record_attempt(&self, attempt: ExecutionAttempt) {
        // observations are advisory; a full channel just drops them
        let _ = self.observations.try_send(Observation::Attempt(attempt));
    }
}

fn prepared_call(prep: &PreprocessedRequest) -> PreparedCall {
    PreparedCall {
        request_id: prep.id(),
        kind: prep.request.kind,
        content: prep.request.content.clone(),
        parameters: prep.request.parameters.clone(),
        attachments: prep.request.attachments.clone(),
        max_output_tokens: prep.estimated_tokens.output,
        response_format: prep.request.preferences.response_format.clone(),
    }
}
