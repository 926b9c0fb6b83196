//! The assembled routing core.
//!
//! `RoutingCore` wires the stages together in dependency order (cache, then
//! registry observation, then router, breakers, executor, batcher, response
//! processor) and exposes the in-process submission API: `submit`,
//! `submit_streaming`, and `cancel`.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::batch::Batcher;
use crate::cache::{CacheOutcome, KVStore, ResponseCache};
use crate::config::{CoreConfig, TenantPolicies};
use crate::error::{CoreError, Result};
use crate::events::{EventBus, EventKind, EventStream};
use crate::execute::breaker::{BreakerMap, BreakerSettings};
use crate::execute::recovery::ErrorPattern;
use crate::execute::Executor;
use crate::preprocess::Preprocessor;
use crate::registry::AgentRegistry;
use crate::respond::{QualityScorer, ResponseProcessor};
use crate::router::Router;
use crate::types::{ProcessedResponse, Request, RequestId, StreamChunk};

/// A streaming submission: live chunks plus the terminal response.
pub struct StreamingSubmission {
    /// Chunks as the backend produces them, ending with a `Done` marker.
    pub chunks: ReceiverStream<StreamChunk>,
    /// Resolves once the full response has been post-processed.
    pub response: oneshot::Receiver<Result<ProcessedResponse>>,
}

/// Operator-facing snapshot of the core's moving parts.
#[derive(Debug, Clone)]
pub struct CoreStatus {
    pub queue_depth: usize,
    pub shedding: bool,
    pub registered_agents: usize,
    pub breaker_states: Vec<(String, &'static str)>,
    pub cache_builds_in_flight: usize,
}

/// The five-stage pipeline behind `submit`.
pub struct RoutingCore {
    bus: Arc<EventBus>,
    policies: Arc<TenantPolicies>,
    cache: Arc<ResponseCache>,
    registry: Arc<AgentRegistry>,
    preprocessor: Preprocessor,
    router: Router,
    batcher: Arc<Batcher>,
    breakers: Arc<BreakerMap>,
    executor: Arc<Executor>,
    shutdown: CancellationToken,
}

impl RoutingCore {
    /// Build and start a core with default tenant policies and the heuristic
    /// quality scorer.
    pub fn new(
        config: CoreConfig,
        registry: Arc<AgentRegistry>,
        store: Arc<dyn KVStore>,
    ) -> Result<Arc<Self>> {
        Self::with_options(config, registry, store, TenantPolicies::new(), None)
    }

    /// Build and start a core with explicit tenant policies and an optional
    /// quality scorer override.
    pub fn with_options(
        config: CoreConfig,
        registry: Arc<AgentRegistry>,
        store: Arc<dyn KVStore>,
        policies: Arc<TenantPolicies>,
        scorer: Option<Arc<dyn QualityScorer>>,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let bus = EventBus::new(config.event_capacity);

        let cache = ResponseCache::new(store, config.cache_ttl(), bus.clone());
        let (observations, _observer) = registry.spawn_observer(config.observation_capacity);
        let router = Router::new(registry.clone(), bus.clone(), config.emergency_agent.clone());
        let breakers = BreakerMap::new(
            BreakerSettings::from(config.as_ref()),
            bus.clone(),
            registry.clone(),
        );
        let executor = Executor::new(
            &config,
            registry.clone(),
            breakers.clone(),
            policies.clone(),
            bus.clone(),
            observations.clone(),
        );
        let processor = match scorer {
            Some(scorer) => ResponseProcessor::with_scorer(bus.clone(), scorer),
            None => ResponseProcessor::new(bus.clone()),
        };
        let batcher = Batcher::new(
            config.clone(),
            bus.clone(),
            executor.clone(),
            processor,
            observations,
        );
        let preprocessor = Preprocessor::new(
            config.preprocessor.clone(),
            config.max_content_len,
            policies.clone(),
            bus.clone(),
        )?;

        let shutdown = CancellationToken::new();
        batcher.run(shutdown.clone());

        Ok(Arc::new(Self {
            bus,
            policies,
            cache,
            registry,
            preprocessor,
            router,
            batcher,
            breakers,
            executor,
            shutdown,
        }))
    }

    /// Submit a request and await its terminal response.
    ///
    /// Exactly one of a `ProcessedResponse`, a terminal error, or `Cancelled`
    /// results from every submission.
    #[tracing::instrument(skip_all, fields(request_id = %request.id, tenant_id = %request.tenant_id))]
    pub async fn submit(&self, request: Request) -> Result<ProcessedResponse> {
        let request_id = request.id;
        if self.batcher.is_shedding() {
            self.bus.publish(
                EventKind::RequestRejected,
                Some(request_id),
                json!({"reason": "overloaded"}),
            );
            metrics::counter!("conflux_requests_shed_total").increment(1);
            return Err(CoreError::Overloaded);
        }

        let prep = self.preprocessor.preprocess(request)?;
        if prep.request.is_expired(Utc::now()) {
            return Err(CoreError::TimeoutExceeded);
        }

        let guard = match self.cache.lookup(&prep).await? {
            CacheOutcome::Hit(response) => return Ok(*response),
            CacheOutcome::Join(rx) => return ResponseCache::join(rx).await,
            CacheOutcome::Build(guard) => Some(guard),
            CacheOutcome::Bypass => None,
        };

        let policy = self.policies.get(&prep.request.tenant_id);
        let decision = match self.router.route(&prep, &policy) {
            Ok(decision) => decision,
            Err(error) => {
                if let Some(guard) = guard {
                    guard.fail(&error);
                }
                return Err(error);
            }
        };

        let rx = self.batcher.submit(prep, decision, None);
        let result = match rx.await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Internal(anyhow::anyhow!(
                "pipeline worker dropped before responding"
            ))),
        };

        if let Some(guard) = guard {
            match &result {
                Ok(response) => {
                    guard.complete(response).await;
                    self.bus.publish(
                        EventKind::ResponseCached,
                        Some(request_id),
                        json!({}),
                    );
                }
                Err(error) => guard.fail(error),
            }
        }
        result
    }

    /// Submit a request, receiving chunks as they stream plus the final
    /// processed response.
    ///
    /// Streaming submissions bypass the cache: a stored response cannot be
    /// replayed as a live stream.
    #[tracing::instrument(skip_all, fields(request_id = %request.id))]
    pub async fn submit_streaming(&self, request: Request) -> Result<StreamingSubmission> {
        let request_id = request.id;
        if self.batcher.is_shedding() {
            self.bus.publish(
                EventKind::RequestRejected,
                Some(request_id),
                json!({"reason": "overloaded"}),
            );
            return Err(CoreError::Overloaded);
        }

        let prep = self.preprocessor.preprocess(request)?;
        if prep.request.is_expired(Utc::now()) {
            return Err(CoreError::TimeoutExceeded);
        }

        let policy = self.policies.get(&prep.request.tenant_id);
        let decision = self.router.route(&prep, &policy)?;

        let (chunk_tx, chunk_rx) = mpsc::channel(64);
        let rx = self.batcher.submit(prep, decision, Some(chunk_tx));

        let (response_tx, response_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = match rx.await {
                Ok(result) => result,
                Err(_) => Err(CoreError::Internal(anyhow::anyhow!(
                    "pipeline worker dropped before responding"
                ))),
            };
            let _ = response_tx.send(result);
        });

        Ok(StreamingSubmission {
            chunks: ReceiverStream::new(chunk_rx),
            response: response_rx,
        })
    }

    /// Cancel a pending or in-flight request. Returns whether anything was
    /// found to cancel.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        self.batcher.cancel(request_id)
    }

    /// Subscribe to the event bus.
    pub fn events(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// Tenant policy store, for runtime policy updates.
    pub fn policies(&self) -> &Arc<TenantPolicies> {
        &self.policies
    }

    /// The agent registry backing this core.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Observed failure patterns, most frequent first.
    pub fn error_patterns(&self) -> Vec<ErrorPattern> {
        self.executor.error_patterns()
    }

    /// Point-in-time operational snapshot.
    pub fn status(&self) -> CoreStatus {
        CoreStatus {
            queue_depth: self.batcher.queue_depth(),
            shedding: self.batcher.is_shedding(),
            registered_agents: self.registry.len(),
            breaker_states: self.breakers.states(),
            cache_builds_in_flight: self.cache.inflight_count(),
        }
    }

    /// Stop the background loops. In-flight work is abandoned.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for RoutingCore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
