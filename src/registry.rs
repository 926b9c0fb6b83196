//! Agent registry and capability index.
//!
//! Keeps the inventory of routable backends together with their rolling
//! performance statistics. Readers take point-in-time snapshots; writers
//! serialize through a per-agent lock, so no torn view is ever observed.
//! Execution observations arrive over a one-way channel so the registry never
//! calls back into the executor.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::provider::Provider;
use crate::types::{AgentId, AttemptOutcome, ExecutionAttempt, TokenEstimate};

/// Smoothing factor for rolling latency/success/quality statistics.
const EWMA_ALPHA: f64 = 0.2;

/// Minimum time an agent stays `Degraded` when crossing between
/// `Offline` and `Healthy`, to avoid flapping.
pub const HEALTH_DWELL: Duration = Duration::from_secs(30);

/// Health of a routable backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

/// Whether a backend is a low-level provider or a higher-level agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Provider,
    Agent,
}

/// Static registration data for a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub kind: AgentKind,
    /// Opaque backend family tag (e.g. "hosted-a", "local"); fallback
    /// routing prefers staying within a family.
    pub backend: String,
    /// Capability set with per-capability proficiency in [0, 1].
    pub capabilities: BTreeMap<String, f64>,
    pub cost_per_input_token: f64,
    pub cost_per_output_token: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub max_concurrency: usize,
    /// Initial quality score in [0, 1]; refined by observations.
    pub quality_score: f64,
    /// Ordering hint for last-resort fallback routing; higher wins.
    pub routing_priority: u32,
}

impl AgentProfile {
    pub fn new(id: impl Into<AgentId>, kind: AgentKind, backend: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            backend: backend.into(),
            capabilities: BTreeMap::new(),
            cost_per_input_token: 0.000_002,
            cost_per_output_token: 0.000_006,
            latency_p50_ms: 500.0,
            latency_p95_ms: 1500.0,
            max_concurrency: 10,
            quality_score: 0.7,
            routing_priority: 0,
        }
    }

    pub fn with_capability(mut self, name: impl Into<String>, proficiency: f64) -> Self {
        self.capabilities.insert(name.into(), proficiency.clamp(0.0, 1.0));
        self
    }

    pub fn with_costs(mut self, input: f64, output: f64) -> Self {
        self.cost_per_input_token = input;
        self.cost_per_output_token = output;
        self
    }

    pub fn with_latency(mut self, p50_ms: f64, p95_ms: f64) -> Self {
        self.latency_p50_ms = p50_ms;
        self.latency_p95_ms = p95_ms;
        self
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality_score = quality.clamp(0.0, 1.0);
        self
    }

    pub fn with_routing_priority(mut self, priority: u32) -> Self {
        self.routing_priority = priority;
        self
    }
}

/// Point-in-time view of one agent, safe to hold across awaits.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub kind: AgentKind,
    pub backend: String,
    pub capabilities: Arc<BTreeMap<String, f64>>,
    pub cost_per_input_token: f64,
    pub cost_per_output_token: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub max_concurrency: usize,
    pub health: HealthState,
    pub quality_score: f64,
    pub success_rate: f64,
    /// In-flight attempts divided by max concurrency, in [0, 1].
    pub utilization: f64,
    pub routing_priority: u32,
}

impl AgentSnapshot {
    /// Routable for selection. Offline and unhealthy agents never are.
    pub fn available(&self) -> bool {
        matches!(self.health, HealthState::Healthy | HealthState::Degraded)
    }

    /// Cost weight used by cost-optimized selection: input price plus three
    /// times the output price.
    pub fn cost_weight(&self) -> f64 {
        self.cost_per_input_token + self.cost_per_output_token * 3.0
    }

    /// Estimated cost of serving a request with the given token estimate.
    pub fn estimated_cost(&self, tokens: &TokenEstimate) -> f64 {
        tokens.input as f64 * self.cost_per_input_token
            + tokens.output as f64 * self.cost_per_output_token
    }

    /// Whether this agent's capability set covers all required capabilities.
    pub fn covers(&self, required: &BTreeSet<String>) -> bool {
        required.iter().all(|c| self.capabilities.contains_key(c))
    }

    pub fn proficiency(&self, capability: &str) -> f64 {
        self.capabilities.get(capability).copied().unwrap_or(0.0)
    }
}

#[derive(Debug)]
struct AgentStats {
    health: HealthState,
    health_since: DateTime<Utc>,
    /// Target of an offline↔healthy crossing parked in `Degraded`.
    pending_health: Option<HealthState>,
    latency_p50_ms: f64,
    latency_p95_ms: f64,
    success_rate: f64,
    quality_score: f64,
}

struct AgentEntry {
    profile: AgentProfile,
    capabilities: Arc<BTreeMap<String, f64>>,
    provider: Arc<dyn Provider>,
    stats: RwLock<AgentStats>,
    in_flight: AtomicUsize,
}

/// An execution observation consumed by the registry.
#[derive(Debug, Clone)]
pub enum Observation {
    Attempt(ExecutionAttempt),
    Quality(AgentId, f64),
}

/// Decrements the agent's in-flight count when dropped.
pub struct InflightGuard {
    entry: Arc<AgentEntry>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.entry.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Inventory of routable backends with rolling statistics.
pub struct AgentRegistry {
    agents: DashMap<AgentId, Arc<AgentEntry>>,
    dwell: Duration,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self {
            agents: DashMap::new(),
            dwell: HEALTH_DWELL,
        }
    }
}

impl AgentRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Override the degraded dwell time (tests use short dwells).
    pub fn with_dwell(dwell: Duration) -> Arc<Self> {
        Arc::new(Self {
            agents: DashMap::new(),
            dwell,
        })
    }

    /// Register a backend. Replaces any previous registration for the id.
    pub fn register(&self, profile: AgentProfile, provider: Arc<dyn Provider>) {
        let id = profile.id.clone();
        let capabilities = Arc::new(profile.capabilities.clone());
        let stats = AgentStats {
            health: HealthState::Healthy,
            health_since: Utc::now(),
            pending_health: None,
            latency_p50_ms: profile.latency_p50_ms,
            latency_p95_ms: profile.latency_p95_ms,
            success_rate: 1.0,
            quality_score: profile.quality_score,
        };
        let entry = Arc::new(AgentEntry {
            profile,
            capabilities,
            provider,
            stats: RwLock::new(stats),
            in_flight: AtomicUsize::new(0),
        });
        self.agents.insert(id.clone(), entry);
        metrics::gauge!("conflux_registered_agents").set(self.agents.len() as f64);
        tracing::info!(agent_id = %id, "Registered agent");
    }

    pub fn remove(&self, id: &AgentId) {
        self.agents.remove(id);
        metrics::gauge!("conflux_registered_agents").set(self.agents.len() as f64);
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// The provider handle behind an agent id.
    pub fn provider(&self, id: &AgentId) -> Option<Arc<dyn Provider>> {
        self.agents.get(id).map(|e| e.provider.clone())
    }

    /// A consistent point-in-time view of one agent.
    pub fn get(&self, id: &AgentId) -> Option<AgentSnapshot> {
        self.agents.get(id).map(|e| Self::snapshot_entry(&e))
    }

    /// Snapshots of all agents, or only routable ones, sorted by id for
    /// deterministic iteration. Callers re-sort by cost/latency/quality.
    pub fn list(&self, healthy_only: bool) -> Vec<AgentSnapshot> {
        let mut out: Vec<_> = self
            .agents
            .iter()
            .map(|e| Self::snapshot_entry(e.value()))
            .filter(|s| !healthy_only || s.available())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Routable agents covering every required capability, ranked by the
    /// weighted mean proficiency over the requirement set. Ties break by
    /// higher quality, then lower latency, then lower cost.
    pub fn get_by_capabilities(
        &self,
        required: &BTreeSet<String>,
        weights: Option<&BTreeMap<String, f64>>,
    ) -> Vec<(AgentSnapshot, f64)> {
        let mut scored: Vec<_> = self
            .list(true)
            .into_iter()
            .filter(|s| s.covers(required))
            .map(|s| {
                let score = capability_score(&s, required, weights);
                (s, score)
            })
            .collect();
        scored.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.quality_score
                        .partial_cmp(&a.quality_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| {
                    a.latency_p50_ms
                        .partial_cmp(&b.latency_p50_ms)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| {
                    a.cost_weight()
                        .partial_cmp(&b.cost_weight())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.id.cmp(&b.id))
        });
        scored
    }

    /// Update an agent's health state. Idempotent. Transitions between
    /// `Offline` and `Healthy` (either direction) park in `Degraded` and only
    /// complete once the dwell time has elapsed, so a flapping backend cannot
    /// oscillate between the extremes.
    pub fn update_health(&self, id: &AgentId, target: HealthState) {
        let Some(entry) = self.agents.get(id) else {
            return;
        };
        let mut stats = entry.stats.write();
        if stats.health == target {
            return;
        }

        let crossing = matches!(
            (stats.health, target),
            (HealthState::Offline, HealthState::Healthy)
                | (HealthState::Healthy, HealthState::Offline)
        );
        if crossing {
            stats.health = HealthState::Degraded;
            stats.health_since = Utc::now();
            stats.pending_health = Some(target);
            tracing::info!(agent_id = %id, target = ?target, "Health crossing parked in degraded");
            return;
        }

        if stats.health == HealthState::Degraded && stats.pending_health == Some(target) {
            let dwelled = (Utc::now() - stats.health_since)
                .to_std()
                .map(|d| d >= self.dwell)
                .unwrap_or(false);
            if !dwelled {
                return;
            }
        }

        tracing::info!(agent_id = %id, from = ?stats.health, to = ?target, "Agent health updated");
        stats.health = target;
        stats.health_since = Utc::now();
        stats.pending_health = None;
    }

    /// Fold an execution attempt into the agent's rolling statistics.
    pub fn observe(&self, attempt: &ExecutionAttempt) {
        let Some(entry) = self.agents.get(&attempt.agent_id) else {
            return;
        };
        let mut stats = entry.stats.write();

        if let Some(latency) = attempt.latency_ms() {
            stats.latency_p50_ms = ewma(stats.latency_p50_ms, latency, EWMA_ALPHA);
            // p95 tracks peaks: fast to rise, slow to decay.
            if latency > stats.latency_p95_ms {
                stats.latency_p95_ms = ewma(stats.latency_p95_ms, latency, EWMA_ALPHA);
            } else {
                stats.latency_p95_ms = ewma(stats.latency_p95_ms, latency, EWMA_ALPHA / 4.0);
            }
            metrics::histogram!(
                "conflux_attempt_latency_ms",
                "agent" => attempt.agent_id.as_str().to_string()
            )
            .record(latency);
        }

        match attempt.outcome {
            AttemptOutcome::Success => {
                stats.success_rate = ewma(stats.success_rate, 1.0, EWMA_ALPHA);
            }
            AttemptOutcome::RetryableFailure
            | AttemptOutcome::FatalFailure
            | AttemptOutcome::Timeout => {
                stats.success_rate = ewma(stats.success_rate, 0.0, EWMA_ALPHA);
            }
            AttemptOutcome::Cancelled => {}
        }
    }

    /// Fold a per-response quality score (0–10 scale) into the agent's
    /// rolling quality (0–1 scale).
    pub fn observe_quality(&self, id: &AgentId, quality_score: f64) {
        let Some(entry) = self.agents.get(id) else {
            return;
        };
        let mut stats = entry.stats.write();
        let normalized = (quality_score / 10.0).clamp(0.0, 1.0);
        stats.quality_score = ewma(stats.quality_score, normalized, EWMA_ALPHA);
    }

    /// Mark an attempt in flight against an agent. The returned guard
    /// decrements the count when dropped.
    pub fn begin_attempt(&self, id: &AgentId) -> Option<InflightGuard> {
        let entry = self.agents.get(id)?.clone();
        entry.in_flight.fetch_add(1, Ordering::Relaxed);
        Some(InflightGuard { entry })
    }

    /// Spawn the observation consumer, returning the channel to feed it.
    ///
    /// The executor pushes observations here instead of calling the registry
    /// directly, keeping the Router → Registry → Executor edge one-way.
    pub fn spawn_observer(
        self: &Arc<Self>,
        capacity: usize,
    ) -> (mpsc::Sender<Observation>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Observation>(capacity.max(1));
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(observation) = rx.recv().await {
                match observation {
                    Observation::Attempt(attempt) => registry.observe(&attempt),
                    Observation::Quality(id, q) => registry.observe_quality(&id, q),
                }
            }
        });
        (tx, handle)
    }

    /// Spawn a loop that polls every provider's health probe and folds the
    /// reports into registry health. The dwell rule in [`Self::update_health`]
    /// keeps a flapping probe from oscillating an agent between `Offline`
    /// and `Healthy`.
    pub fn spawn_health_prober(
        self: &Arc<Self>,
        interval: Duration,
        token: tokio_util::sync::CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let providers: Vec<(AgentId, Arc<dyn Provider>)> = registry
                            .agents
                            .iter()
                            .map(|e| (e.key().clone(), e.value().provider.clone()))
                            .collect();
                        for (id, provider) in providers {
                            let report = provider.health_probe().await;
                            registry.update_health(&id, report.state);
                        }
                    }
                }
            }
        })
    }

    fn snapshot_entry(entry: &AgentEntry) -> AgentSnapshot {
        let stats = entry.stats.read();
        let in_flight = entry.in_flight.load(Ordering::Relaxed);
        let utilization = if entry.profile.max_concurrency == 0 {
            1.0
        } else {
            (in_flight as f64 / entry.profile.max_concurrency as f64).min(1.0)
        };
        AgentSnapshot {
            id: entry.profile.id.clone(),
            kind: entry.profile.kind,
            backend: entry.profile.backend.clone(),
            capabilities: entry.capabilities.clone(),
            cost_per_input_token: entry.profile.cost_per_input_token,
            cost_per_output_token: entry.profile.cost_per_output_token,
            latency_p50_ms: stats.latency_p50_ms,
            latency_p95_ms: stats.latency_p95_ms,
            max_concurrency: entry.profile.max_concurrency,
            health: stats.health,
            quality_score: stats.quality_score,
            success_rate: stats.success_rate,
            utilization,
            routing_priority: entry.profile.routing_priority,
        }
    }
}

fn ewma(current: f64, sample: f64, alpha: f64) -> f64 {
    current + alpha * (sample - current)
}

fn capability_score(
    snapshot: &AgentSnapshot,
    required: &BTreeSet<String>,
    weights: Option<&BTreeMap<String, f64>>,
) -> f64 {
    if required.is_empty() {
        return snapshot.quality_score;
    }
    let mut total = 0.0;
    let mut weight_sum = 0.0;
    for capability in required {
        let weight = weights
            .and_then(|w| w.get(capability))
            .copied()
            .unwrap_or(1.0);
        total += snapshot.proficiency(capability) * weight;
        weight_sum += weight;
    }
    if weight_sum == 0.0 { 0.0 } else { total / weight_sum }
}
