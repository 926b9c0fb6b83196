//! Strategy-based backend selection.
//!
//! The router walks an ordered list of strategies; each strategy is a
//! predicate over the request plus a selector over the candidate agents.
//! The first strategy that applies and selects wins. When every strategy
//! comes up empty the router falls back to the configured emergency agent,
//! then to any routable candidate, and only then fails.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde_json::json;

use crate::config::TenantPolicy;
use crate::error::{CoreError, Result};
use crate::events::{EventBus, EventKind};
use crate::registry::{AgentRegistry, AgentSnapshot};
use crate::types::{AgentId, PreprocessedRequest, RoutingDecision, TenantTier};

/// Number of alternatives carried in a decision's fallback chain.
const FALLBACK_CHAIN_LEN: usize = 3;

/// Latency gate for the high-priority strategy, milliseconds.
const HIGH_PRIORITY_LATENCY_MS: f64 = 2000.0;

/// Minimum proficiency for specialization routing.
const SPECIALIZATION_FLOOR: f64 = 0.6;

/// Ambient request facts a strategy predicate may consult.
pub struct RouteContext<'a> {
    pub policy: &'a TenantPolicy,
}

/// The outcome of a strategy's selector.
pub struct Selection {
    pub agent_id: AgentId,
    pub reason: String,
    pub breakdown: BTreeMap<String, f64>,
}

/// A routing strategy: a predicate plus a selector.
pub trait RouteStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    /// Strategies are attempted in descending priority.
    fn priority(&self) -> u32;
    fn applies(&self, prep: &PreprocessedRequest, ctx: &RouteContext<'_>) -> bool;
    fn select(&self, prep: &PreprocessedRequest, candidates: &[AgentSnapshot])
    -> Option<Selection>;
}

/// Deterministic tie-break shared by every strategy: higher quality, then
/// lower p95 latency, then lower cost, then lexicographic id.
pub(crate) fn compare_agents(a: &AgentSnapshot, b: &AgentSnapshot) -> Ordering {
    b.quality_score
        .partial_cmp(&a.quality_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            a.latency_p95_ms
                .partial_cmp(&b.latency_p95_ms)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| {
            a.cost_weight()
                .partial_cmp(&b.cost_weight())
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.id.cmp(&b.id))
}

struct HighPriority;

impl RouteStrategy for HighPriority {
    fn name(&self) -> &'static str {
        "highPriority"
    }

    fn priority(&self) -> u32 {
        100
    }

    fn applies(&self, prep: &PreprocessedRequest, _ctx: &RouteContext<'_>) -> bool {
        prep.effective_priority >= 8
    }

    fn select(
        &self,
        _prep: &PreprocessedRequest,
        candidates: &[AgentSnapshot],
    ) -> Option<Selection> {
        let mut fast: Vec<&AgentSnapshot> = candidates
            .iter()
            .filter(|a| a.health == crate::registry::HealthState::Healthy)
            .filter(|a| a.latency_p50_ms < HIGH_PRIORITY_LATENCY_MS)
            .collect();
        fast.sort_by(|a, b| compare_agents(a, b));
        let chosen = fast.first()?;
        let mut breakdown = BTreeMap::new();
        breakdown.insert("quality_score".into(), chosen.quality_score);
        breakdown.insert("latency_p50_ms".into(), chosen.latency_p50_ms);
        Some(Selection {
            agent_id: chosen.id.clone(),
            reason: format!(
                "highest quality among fast healthy agents (p50 {:.0} ms)",
                chosen.latency_p50_ms
            ),
            breakdown,
        })
    }
}

struct AgentSpecialization;

impl RouteStrategy for AgentSpecialization {
    fn name(&self) -> &'static str {
        "agentSpecialization"
    }

    fn priority(&self) -> u32 {
        90
    }

    fn applies(&self, prep: &PreprocessedRequest, _ctx: &RouteContext<'_>) -> bool {
        prep.request.kind.wants_specialist()
    }

    fn select(
        &self,
        prep: &PreprocessedRequest,
        candidates: &[AgentSnapshot],
    ) -> Option<Selection> {
        let capability = prep.request.kind.as_str();
        let mut skilled: Vec<&AgentSnapshot> = candidates
            .iter()
            .filter(|a| a.proficiency(capability) >= SPECIALIZATION_FLOOR)
            .collect();
        skilled.sort_by(|a, b| {
            b.proficiency(capability)
                .partial_cmp(&a.proficiency(capability))
                .unwrap_or(Ordering::Equal)
                .then_with(|| compare_agents(a, b))
        });
        let chosen = skilled.first()?;
        let proficiency = chosen.proficiency(capability);
        let mut breakdown = BTreeMap::new();
        breakdown.insert("proficiency".into(), proficiency);
        breakdown.insert("quality_score".into(), chosen.quality_score);
        Some(Selection {
            agent_id: chosen.id.clone(),
            reason: format!("best {capability} specialist (proficiency {proficiency:.2})"),
            breakdown,
        })
    }
}

struct CapabilityRequired;

impl RouteStrategy for CapabilityRequired {
    fn name(&self) -> &'static str {
        "capabilityRequired"
    }

    fn priority(&self) -> u32 {
        85
    }

    fn applies(&self, prep: &PreprocessedRequest, _ctx: &RouteContext<'_>) -> bool {
        !prep.request.required_capabilities.is_empty()
    }

    fn select(
        &self,
        prep: &PreprocessedRequest,
        candidates: &[AgentSnapshot],
    ) -> Option<Selection> {
        let required = &prep.request.required_capabilities;
        let mean = |a: &AgentSnapshot| {
            required.iter().map(|c| a.proficiency(c)).sum::<f64>() / required.len() as f64
        };
        // candidates are pre-filtered to cover the requirement set
        let mut ranked: Vec<&AgentSnapshot> = candidates.iter().collect();
        ranked.sort_by(|a, b| {
            mean(b)
                .partial_cmp(&mean(a))
                .unwrap_or(Ordering::Equal)
                .then_with(|| compare_agents(a, b))
        });
        let chosen = ranked.first()?;
        let match_quality = mean(chosen);
        let mut breakdown = BTreeMap::new();
        breakdown.insert("match_quality".into(), match_quality);
        Some(Selection {
            agent_id: chosen.id.clone(),
            reason: format!(
                "covers {} required capabilities (match {match_quality:.2})",
                required.len()
            ),
            breakdown,
        })
    }
}

struct CostOptimized;

impl RouteStrategy for CostOptimized {
    fn name(&self) -> &'static str {
        "costOptimized"
    }

    fn priority(&self) -> u32 {
        80
    }

    fn applies(&self, prep: &PreprocessedRequest, ctx: &RouteContext<'_>) -> bool {
        ctx.policy.tier == TenantTier::Free || prep.estimated_cost > 0.1
    }

    fn select(
        &self,
        _prep: &PreprocessedRequest,
        candidates: &[AgentSnapshot],
    ) -> Option<Selection> {
        let mut cheap: Vec<&AgentSnapshot> = candidates
            .iter()
            .filter(|a| a.health == crate::registry::HealthState::Healthy)
            .collect();
        cheap.sort_by(|a, b| {
            a.cost_weight()
                .partial_cmp(&b.cost_weight())
                .unwrap_or(Ordering::Equal)
                .then_with(|| compare_agents(a, b))
        });
        let chosen = cheap.first()?;
        let mut breakdown = BTreeMap::new();
        breakdown.insert("cost_weight".into(), chosen.cost_weight());
        Some(Selection {
            agent_id: chosen.id.clone(),
            reason: format!("lowest cost weight {:.8}", chosen.cost_weight()),
            breakdown,
        })
    }
}

struct LoadBalanced;

impl RouteStrategy for LoadBalanced {
    fn name(&self) -> &'static str {
        "loadBalanced"
    }

    fn priority(&self) -> u32 {
        70
    }

    fn applies(&self, _prep: &PreprocessedRequest, _ctx: &RouteContext<'_>) -> bool {
        true
    }

    fn select(
        &self,
        _prep: &PreprocessedRequest,
        candidates: &[AgentSnapshot],
    ) -> Option<Selection> {
        if candidates.is_empty() {
            return None;
        }
        let weights: Vec<f64> = candidates
            .iter()
            .map(|a| ((1.0 - a.utilization) * a.quality_score).max(0.0))
            .collect();
        let total: f64 = weights.iter().sum();

        let index = if total <= f64::EPSILON {
            // everyone saturated or zero quality: fall back to uniform
            rand::rng().random_range(0..candidates.len())
        } else {
            let mut point = rand::rng().random_range(0.0..total);
            let mut picked = candidates.len() - 1;
            for (i, w) in weights.iter().enumerate() {
                if point < *w {
                    picked = i;
                    break;
                }
                point -= w;
            }
            picked
        };

        let chosen = &candidates[index];
        let mut breakdown = BTreeMap::new();
        breakdown.insert("weight".into(), weights[index]);
        breakdown.insert("utilization".into(), chosen.utilization);
        Some(Selection {
            agent_id: chosen.id.clone(),
            reason: format!(
                "weighted random (weight {:.3} of {:.3})",
                weights[index], total
            ),
            breakdown,
        })
    }
}

/// Strategy-chain router over the agent registry.
pub struct Router {
    registry: Arc<AgentRegistry>,
    strategies: Vec<Box<dyn RouteStrategy>>,
    emergency_agent: Option<AgentId>,
    bus: Arc<EventBus>,
}

impl Router {
    pub fn new(
        registry: Arc<AgentRegistry>,
        bus: Arc<EventBus>,
        emergency_agent: Option<AgentId>,
    ) -> Self {
        Self::with_strategies(registry, bus, emergency_agent, default_strategies())
    }

    pub fn with_strategies(
        registry: Arc<AgentRegistry>,
        bus: Arc<EventBus>,
        emergency_agent: Option<AgentId>,
        mut strategies: Vec<Box<dyn RouteStrategy>>,
    ) -> Self {
        strategies.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Self {
            registry,
            strategies,
            emergency_agent,
            bus,
        }
    }

    /// Pick a backend for the request, or fail with `NoAgentAvailable`.
    #[tracing::instrument(skip(self, prep, policy), fields(request_id = %prep.id()))]
    pub fn route(
        &self,
        prep: &PreprocessedRequest,
        policy: &TenantPolicy,
    ) -> Result<RoutingDecision> {
        let candidates = self.candidates(prep);
        let ctx = RouteContext { policy };

        // An explicit preference short-circuits the strategy chain when the
        // preferred agent is among the viable candidates.
        if let Some(preferred) = &prep.request.preferences.preferred_agent {
            if candidates.iter().any(|a| &a.id == preferred) {
                let decision = self.decision(
                    prep,
                    &candidates,
                    Selection {
                        agent_id: preferred.clone(),
                        reason: "caller-preferred agent".into(),
                        breakdown: BTreeMap::new(),
                    },
                    "preferred",
                );
                self.publish_success(&decision);
                return Ok(decision);
            }
        }

        for strategy in &self.strategies {
            if !strategy.applies(prep, &ctx) {
                continue;
            }
            if let Some(selection) = strategy.select(prep, &candidates) {
                let decision = self.decision(prep, &candidates, selection, strategy.name());
                self.publish_success(&decision);
                return Ok(decision);
            }
        }

        self.fallback_route(prep, &candidates)
    }

    /// Fallback routing when no strategy produced a selection: the configured
    /// emergency agent if routable, then any routable candidate by priority.
    fn fallback_route(
        &self,
        prep: &PreprocessedRequest,
        candidates: &[AgentSnapshot],
    ) -> Result<RoutingDecision> {
        if let Some(emergency) = &self.emergency_agent {
            if let Some(snapshot) = self.registry.get(emergency) {
                if snapshot.available() {
                    let decision = self.decision(
                        prep,
                        candidates,
                        Selection {
                            agent_id: emergency.clone(),
                            reason: "configured emergency agent".into(),
                            breakdown: BTreeMap::new(),
                        },
                        "fallback.emergency",
                    );
                    self.publish_fallback(&decision);
                    return Ok(decision);
                }
            }
        }

        let mut ranked: Vec<&AgentSnapshot> = candidates.iter().collect();
        ranked.sort_by(|a, b| {
            b.routing_priority
                .cmp(&a.routing_priority)
                .then_with(|| compare_agents(a, b))
        });
        if let Some(chosen) = ranked.first() {
            let decision = self.decision(
                prep,
                candidates,
                Selection {
                    agent_id: chosen.id.clone(),
                    reason: "last-resort routable agent".into(),
                    breakdown: BTreeMap::new(),
                },
                "fallback.any",
            );
            self.publish_fallback(&decision);
            return Ok(decision);
        }

        self.bus.publish(
            EventKind::RoutingFailed,
            Some(prep.id()),
            json!({"reason": "no routable agent"}),
        );
        metrics::counter!("conflux_routing_failed_total").increment(1);
        Err(CoreError::NoAgentAvailable)
    }

    /// Routable agents that satisfy the request's hard constraints.
    fn candidates(&self, prep: &PreprocessedRequest) -> Vec<AgentSnapshot> {
        self.registry
            .list(true)
            .into_iter()
            .filter(|a| a.covers(&prep.request.required_capabilities))
            .filter(|a| match prep.request.preferences.max_cost {
                Some(max_cost) => a.estimated_cost(&prep.estimated_tokens) <= max_cost,
                None => true,
            })
            .collect()
    }

    fn decision(
        &self,
        prep: &PreprocessedRequest,
        candidates: &[AgentSnapshot],
        selection: Selection,
        strategy: &str,
    ) -> RoutingDecision {
        let mut others: Vec<&AgentSnapshot> = candidates
            .iter()
            .filter(|a| a.id != selection.agent_id)
            .collect();
        others.sort_by(|a, b| compare_agents(a, b));
        let fallback_chain = others
            .into_iter()
            .take(FALLBACK_CHAIN_LEN)
            .map(|a| a.id.clone())
            .collect();

        RoutingDecision {
            request_id: prep.id(),
            agent_id: selection.agent_id,
            strategy: strategy.to_string(),
            fallback_chain,
            reason: selection.reason,
            score_breakdown: selection.breakdown,
            created_at: Utc::now(),
        }
    }

    fn publish_success(&self, decision: &RoutingDecision) {
        tracing::debug!(
            request_id = %decision.request_id,
            agent_id = %decision.agent_id,
            strategy = %decision.strategy,
            "Routed request"
        );
        metrics::counter!("conflux_routing_total", "strategy" => decision.strategy.clone())
            .increment(1);
        self.bus.publish(
            EventKind::RoutingSuccess,
            Some(decision.request_id),
            json!({
                "agent_id": decision.agent_id,
                "strategy": decision.strategy,
                "fallback_chain": decision.fallback_chain,
            }),
        );
    }

    fn publish_fallback(&self, decision: &RoutingDecision) {
        tracing::warn!(
            request_id = %decision.request_id,
            agent_id = %decision.agent_id,
            strategy = %decision.strategy,
            "Routed request via fallback"
        );
        metrics::counter!("conflux_routing_total", "strategy" => decision.strategy.clone())
            .increment(1);
        self.bus.publish(
            EventKind::RoutingFallback,
            Some(decision.request_id),
            json!({
                "agent_id": decision.agent_id,
                "strategy": decision.strategy,
            }),
        );
    }
}

/// The default strategy chain in descending priority.
pub fn default_strategies() -> Vec<Box<dyn RouteStrategy>> {
    vec![
        Box::new(HighPriority),
        Box::new(AgentSpecialization),
        Box::new(CapabilityRequired),
        Box::new(CostOptimized),
        Box::new(LoadBalanced),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantPolicy;
    use crate::preprocess::fingerprint;
    use crate::provider::MockProvider;
    use crate::registry::{AgentKind, AgentProfile, HealthState};
    use crate::types::{Priority, Request, RequestType, TokenEstimate};

    fn prep_for(request: Request, effective_priority: u8, estimated_cost: f64) -> PreprocessedRequest {
        let fp = fingerprint(&request);
        PreprocessedRequest {
            request,
            risk_score: 0,
            effective_priority,
            estimated_tokens: TokenEstimate { input: 100, output: 300 },
            estimated_cost,
            transformations: Vec::new(),
            fingerprint: fp,
            validation_passed: true,
        }
    }

    fn simple_prep(kind: RequestType) -> PreprocessedRequest {
        prep_for(Request::new("acme", kind, "hello world"), 4, 0.001)
    }

    fn policy(tier: TenantTier) -> TenantPolicy {
        TenantPolicy {
            tier,
            ..Default::default()
        }
    }

    fn router_with(profiles: Vec<AgentProfile>) -> (Router, Arc<AgentRegistry>) {
        let registry = AgentRegistry::new();
        for profile in profiles {
            registry.register(profile, Arc::new(MockProvider::new()));
        }
        let router = Router::new(registry.clone(), EventBus::new(64), None);
        (router, registry)
    }

    #[test]
    fn test_high_priority_picks_fast_high_quality() {
        let (router, _registry) = router_with(vec![
            AgentProfile::new("slow-good", AgentKind::Provider, "x")
                .with_quality(0.95)
                .with_latency(5000.0, 9000.0),
            AgentProfile::new("fast-good", AgentKind::Provider, "x")
                .with_quality(0.9)
                .with_latency(300.0, 800.0),
            AgentProfile::new("fast-poor", AgentKind::Provider, "x")
                .with_quality(0.4)
                .with_latency(200.0, 500.0),
        ]);

        let mut request = Request::new("acme", RequestType::Text, "now!");
        request.priority = Priority::Urgent;
        let prep = prep_for(request, 9, 0.001);

        let decision = router.route(&prep, &policy(TenantTier::Pro)).unwrap();
        assert_eq!(decision.strategy, "highPriority");
        assert_eq!(decision.agent_id, AgentId::from("fast-good"));
    }

    #[test]
    fn test_specialization_requires_floor() {
        let (router, _registry) = router_with(vec![
            AgentProfile::new("dabbler", AgentKind::Provider, "x")
                .with_capability("code", 0.5)
                .with_quality(0.9),
            AgentProfile::new("expert", AgentKind::Agent, "x")
                .with_capability("code", 0.95)
                .with_quality(0.7),
        ]);

        let prep = simple_prep(RequestType::Code);
        let decision = router.route(&prep, &policy(TenantTier::Pro)).unwrap();
        assert_eq!(decision.strategy, "agentSpecialization");
        assert_eq!(decision.agent_id, AgentId::from("expert"));
    }

    #[test]
    fn test_capability_required_filters_and_ranks() {
        let (router, _registry) = router_with(vec![
            AgentProfile::new("generalist", AgentKind::Provider, "x")
                .with_capability("text", 0.9),
            AgentProfile::new("translator", AgentKind::Agent, "x")
                .with_capability("text", 0.6)
                .with_capability("translation", 0.9),
        ]);

        let mut request = Request::new("acme", RequestType::Text, "translate this");
        request.required_capabilities.insert("translation".into());
        let prep = prep_for(request, 4, 0.001);

        let decision = router.route(&prep, &policy(TenantTier::Pro)).unwrap();
        assert_eq!(decision.strategy, "capabilityRequired");
        assert_eq!(decision.agent_id, AgentId::from("translator"));
        // the generalist cannot serve this request at all
        assert!(!decision.fallback_chain.contains(&AgentId::from("generalist")));
    }

    #[test]
    fn test_cost_optimized_for_free_tier() {
        let (router, _registry) = router_with(vec![
            AgentProfile::new("pricey", AgentKind::Provider, "x")
                .with_costs(0.00001, 0.00003)
                .with_quality(0.95),
            AgentProfile::new("budget", AgentKind::Provider, "x")
                .with_costs(0.000001, 0.000002)
                .with_quality(0.6),
        ]);

        let prep = simple_prep(RequestType::Text);
        let decision = router.route(&prep, &policy(TenantTier::Free)).unwrap();
        assert_eq!(decision.strategy, "costOptimized");
        assert_eq!(decision.agent_id, AgentId::from("budget"));
    }

    #[test]
    fn test_load_balanced_default_path() {
        let (router, _registry) = router_with(vec![
            AgentProfile::new("a", AgentKind::Provider, "x").with_quality(0.8),
            AgentProfile::new("b", AgentKind::Provider, "x").with_quality(0.8),
        ]);

        let prep = simple_prep(RequestType::Chat);
        let decision = router.route(&prep, &policy(TenantTier::Pro)).unwrap();
        assert_eq!(decision.strategy, "loadBalanced");
        assert!(
            decision.agent_id == AgentId::from("a") || decision.agent_id == AgentId::from("b")
        );
    }

    #[test]
    fn test_offline_agents_never_selected_nor_in_chain() {
        let (router, registry) = router_with(vec![
            AgentProfile::new("up", AgentKind::Provider, "x"),
            AgentProfile::new("down", AgentKind::Provider, "x"),
        ]);
        registry.update_health(&AgentId::from("down"), HealthState::Unhealthy);
        registry.update_health(&AgentId::from("down"), HealthState::Offline);

        for _ in 0..10 {
            let prep = simple_prep(RequestType::Chat);
            let decision = router.route(&prep, &policy(TenantTier::Pro)).unwrap();
            assert_eq!(decision.agent_id, AgentId::from("up"));
            assert!(!decision.fallback_chain.contains(&AgentId::from("down")));
        }
    }

    #[test]
    fn test_no_agent_available() {
        let (router, _registry) = router_with(vec![]);
        let prep = simple_prep(RequestType::Chat);
        let err = router.route(&prep, &policy(TenantTier::Pro)).unwrap_err();
        assert!(matches!(err, CoreError::NoAgentAvailable));
    }

    #[test]
    fn test_emergency_agent_fallback() {
        let registry = AgentRegistry::new();
        registry.register(
            AgentProfile::new("reserve", AgentKind::Provider, "x")
                .with_capability("exotic", 0.2),
            Arc::new(MockProvider::new()),
        );
        let router = Router::new(
            registry.clone(),
            EventBus::new(64),
            Some(AgentId::from("reserve")),
        );

        // no candidate covers the requirement, so strategies all fail
        let mut request = Request::new("acme", RequestType::Text, "hello");
        request.required_capabilities.insert("nonexistent".into());
        let prep = prep_for(request, 4, 0.001);

        let decision = router.route(&prep, &policy(TenantTier::Pro)).unwrap();
        assert_eq!(decision.strategy, "fallback.emergency");
        assert_eq!(decision.agent_id, AgentId::from("reserve"));
    }

    #[test]
    fn test_preferred_agent_short_circuit() {
        let (router, _registry) = router_with(vec![
            AgentProfile::new("a", AgentKind::Provider, "x").with_quality(0.99),
            AgentProfile::new("b", AgentKind::Provider, "x").with_quality(0.2),
        ]);

        let mut request = Request::new("acme", RequestType::Chat, "hello");
        request.preferences.preferred_agent = Some(AgentId::from("b"));
        let prep = prep_for(request, 4, 0.001);

        let decision = router.route(&prep, &policy(TenantTier::Pro)).unwrap();
        assert_eq!(decision.strategy, "preferred");
        assert_eq!(decision.agent_id, AgentId::from("b"));
    }

    #[test]
    fn test_max_cost_preference_filters_candidates() {
        let (router, _registry) = router_with(vec![
            AgentProfile::new("pricey", AgentKind::Provider, "x")
                .with_costs(0.01, 0.03)
                .with_quality(0.99),
            AgentProfile::new("budget", AgentKind::Provider, "x")
                .with_costs(0.0000001, 0.0000002)
                .with_quality(0.5),
        ]);

        let mut request = Request::new("acme", RequestType::Chat, "hello");
        request.preferences.max_cost = Some(0.01);
        let prep = prep_for(request, 4, 0.001);

        for _ in 0..10 {
            let decision = router.route(&prep, &policy(TenantTier::Pro)).unwrap();
            assert_eq!(decision.agent_id, AgentId::from("budget"));
        }
    }

    #[test]
    fn test_tie_break_is_deterministic() {
        let (router, _registry) = router_with(vec![
            AgentProfile::new("beta", AgentKind::Provider, "x").with_quality(0.8),
            AgentProfile::new("alpha", AgentKind::Provider, "x").with_quality(0.8),
        ]);

        let mut request = Request::new("acme", RequestType::Text, "urgent thing");
        request.priority = Priority::Urgent;
        let prep = prep_for(request, 9, 0.001);

        for _ in 0..10 {
            let decision = router.route(&prep, &policy(TenantTier::Pro)).unwrap();
            // identical stats: lexicographic id decides
            assert_eq!(decision.agent_id, AgentId::from("alpha"));
        }
    }

    #[test]
    fn test_fallback_chain_limited_and_ordered() {
        let (router, _registry) = router_with(vec![
            AgentProfile::new("a", AgentKind::Provider, "x").with_quality(0.9),
            AgentProfile::new("b", AgentKind::Provider, "x").with_quality(0.8),
            AgentProfile::new("c", AgentKind::Provider, "x").with_quality(0.7),
            AgentProfile::new("d", AgentKind::Provider, "x").with_quality(0.6),
            AgentProfile::new("e", AgentKind::Provider, "x").with_quality(0.5),
        ]);

        let mut request = Request::new("acme", RequestType::Text, "urgent");
        request.priority = Priority::Urgent;
        let prep = prep_for(request, 9, 0.001);

        let decision = router.route(&prep, &policy(TenantTier::Pro)).unwrap();
        assert_eq!(decision.agent_id, AgentId::from("a"));
        assert_eq!(
            decision.fallback_chain,
            vec![AgentId::from("b"), AgentId::from("c"), AgentId::from("d")]
        );
    }
}
