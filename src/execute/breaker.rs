//! Per-backend circuit breakers.
//!
//! One breaker cell per backend key. All transitions happen under the cell's
//! lock, so state changes are serialized per key. Trips and recoveries are
//! reflected into the agent registry's health so the router stops selecting
//! a tripped backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::events::{EventBus, EventKind};
use crate::registry::{AgentRegistry, HealthState};
use crate::types::AgentId;

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    /// Failures within the window before the circuit opens
    pub threshold: u32,
    /// Rolling window over which failures accumulate
    pub window: Duration,
    /// How long an open circuit waits before allowing a probe
    pub timeout: Duration,
}

impl From<&CoreConfig> for BreakerSettings {
    fn from(config: &CoreConfig) -> Self {
        Self {
            threshold: config.breaker_threshold,
            window: config.breaker_window(),
            timeout: config.breaker_timeout(),
        }
    }
}

#[derive(Debug)]
enum State {
    Closed { failures: u32, window_start: Instant },
    Open { since: Instant },
    HalfOpen { probe_in_flight: bool },
}

impl State {
    fn closed() -> Self {
        State::Closed {
            failures: 0,
            window_start: Instant::now(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            State::Closed { .. } => "closed",
            State::Open { .. } => "open",
            State::HalfOpen { .. } => "halfOpen",
        }
    }
}

/// Map of circuit breakers keyed by backend.
pub struct BreakerMap {
    cells: DashMap<String, Mutex<State>>,
    settings: BreakerSettings,
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
}

impl BreakerMap {
    pub fn new(
        settings: BreakerSettings,
        bus: Arc<EventBus>,
        registry: Arc<AgentRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cells: DashMap::new(),
            settings,
            bus,
            registry,
        })
    }

    /// Check whether a call against this backend may proceed.
    ///
    /// An open circuit refuses fail-fast until the breaker timeout elapses,
    /// then admits exactly one probe; further callers keep getting refused
    /// until the probe resolves.
    pub fn preflight(&self, key: &str) -> Result<()> {
        let (admitted, went_half_open) = {
            let cell = self
                .cells
                .entry(key.to_string())
                .or_insert_with(|| Mutex::new(State::closed()));
            let mut state = cell.lock();
            match &mut *state {
                State::Closed { .. } => (true, false),
                State::Open { since } => {
                    if since.elapsed() >= self.settings.timeout {
                        *state = State::HalfOpen {
                            probe_in_flight: true,
                        };
                        (true, true)
                    } else {
                        (false, false)
                    }
                }
                State::HalfOpen { probe_in_flight } => {
                    if *probe_in_flight {
                        (false, false)
                    } else {
                        *probe_in_flight = true;
                        (true, false)
                    }
                }
            }
        };

        if went_half_open {
            self.bus
                .publish(EventKind::BreakerHalfOpen, None, json!({"backend": key}));
            tracing::info!(backend = %key, "Circuit half-open, admitting probe");
        }
        if admitted {
            Ok(())
        } else {
            metrics::counter!("conflux_breaker_refusals_total").increment(1);
            Err(CoreError::CircuitOpen(key.to_string()))
        }
    }

    /// Record a successful call against this backend.
    pub fn record_success(&self, key: &str) {
        let closed = {
            let Some(cell) = self.cells.get(key) else {
                return;
            };
            let mut state = cell.lock();
            match &mut *state {
                State::Closed { failures, .. } => {
                    *failures = 0;
                    false
                }
                State::HalfOpen { .. } => {
                    *state = State::closed();
                    true
                }
                State::Open { .. } => false,
            }
        };

        if closed {
            self.bus
                .publish(EventKind::BreakerClosed, None, json!({"backend": key}));
            tracing::info!(backend = %key, "Circuit closed after successful probe");
            self.registry
                .update_health(&AgentId::from(key), HealthState::Healthy);
        }
    }

    /// Record a failed call against this backend.
    ///
    /// `counts` is whether the failure advances the closed-state threshold
    /// (client-side faults and auth misconfiguration do not). An outstanding
    /// half-open probe is resolved back to `Open` on any failure, counting
    /// or not, so a probe lost to a non-counting fault cannot wedge the cell
    /// half-open with its probe slot taken forever.
    pub fn record_failure(&self, key: &str, counts: bool) {
        let tripped = {
            let cell = self
                .cells
                .entry(key.to_string())
                .or_insert_with(|| Mutex::new(State::closed()));
            let mut state = cell.lock();
            match &mut *state {
                State::Closed {
                    failures,
                    window_start,
                } => {
                    if !counts {
                        false
                    } else {
                        if window_start.elapsed() > self.settings.window {
                            *failures = 0;
                            *window_start = Instant::now();
                        }
                        *failures += 1;
                        if *failures >= self.settings.threshold {
                            *state = State::Open {
                                since: Instant::now(),
                            };
                            true
                        } else {
                            false
                        }
                    }
                }
                State::HalfOpen { .. } => {
                    *state = State::Open {
                        since: Instant::now(),
                    };
                    true
                }
                State::Open { .. } => false,
            }
        };

        if tripped {
            self.trip(key);
        }
    }

    /// Current state name per backend key, for operator introspection.
    pub fn states(&self) -> Vec<(String, &'static str)> {
        let mut out: Vec<_> = self
            .cells
            .iter()
            .map(|cell| (cell.key().clone(), cell.value().lock().name()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn state_of(&self, key: &str) -> Option<&'static str> {
        self.cells.get(key).map(|cell| cell.lock().name())
    }

    fn trip(&self, key: &str) {
        metrics::counter!("conflux_breaker_trips_total").increment(1);
        self.bus
            .publish(EventKind::BreakerOpen, None, json!({"backend": key}));
        tracing::warn!(backend = %key, "Circuit opened");
        // Degraded, not Unhealthy: the agent stays routable so a request can
        // still target the key and become the half-open probe after the
        // breaker timeout; the breaker itself refuses calls while open.
        self.registry
            .update_health(&AgentId::from(key), HealthState::Degraded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use crate::registry::{AgentKind, AgentProfile};

    fn breakers(threshold: u32, timeout: Duration) -> (Arc<BreakerMap>, Arc<AgentRegistry>) {
        let registry = AgentRegistry::new();
        registry.register(
            AgentProfile::new("backend-a", AgentKind::Provider, "x"),
            Arc::new(MockProvider::new()),
        );
        let settings = BreakerSettings {
            threshold,
            window: Duration::from_secs(60),
            timeout,
        };
        let map = BreakerMap::new(settings, EventBus::new(64), registry.clone());
        (map, registry)
    }

    #[test]
    fn test_opens_at_threshold() {
        let (map, registry) = breakers(3, Duration::from_secs(60));

        map.record_failure("backend-a", true);
        map.record_failure("backend-a", true);
        assert!(map.preflight("backend-a").is_ok());

        map.record_failure("backend-a", true);
        assert_eq!(map.state_of("backend-a"), Some("open"));
        assert!(matches!(
            map.preflight("backend-a"),
            Err(CoreError::CircuitOpen(_))
        ));

        // trip is reflected into registry health, but keeps the agent routable
        let snap = registry.get(&AgentId::from("backend-a")).unwrap();
        assert_eq!(snap.health, HealthState::Degraded);
        assert!(snap.available());
    }

    #[test]
    fn test_success_resets_closed_count() {
        let (map, _registry) = breakers(3, Duration::from_secs(60));
        map.record_failure("backend-a", true);
        map.record_failure("backend-a", true);
        map.record_success("backend-a");
        map.record_failure("backend-a", true);
        map.record_failure("backend-a", true);
        assert_eq!(map.state_of("backend-a"), Some("closed"));
    }

    #[test]
    fn test_half_open_single_probe() {
        let (map, _registry) = breakers(1, Duration::from_millis(10));
        map.record_failure("backend-a", true);
        assert_eq!(map.state_of("backend-a"), Some("open"));

        std::thread::sleep(Duration::from_millis(20));

        // first caller becomes the probe
        assert!(map.preflight("backend-a").is_ok());
        assert_eq!(map.state_of("backend-a"), Some("halfOpen"));
        // concurrent callers are refused while the probe is out
        assert!(matches!(
            map.preflight("backend-a"),
            Err(CoreError::CircuitOpen(_))
        ));
    }

    #[test]
    fn test_half_open_success_closes() {
        let (map, registry) = breakers(1, Duration::from_millis(10));
        map.record_failure("backend-a", true);
        std::thread::sleep(Duration::from_millis(20));
        assert!(map.preflight("backend-a").is_ok());

        map.record_success("backend-a");
        assert_eq!(map.state_of("backend-a"), Some("closed"));
        assert!(map.preflight("backend-a").is_ok());

        let snap = registry.get(&AgentId::from("backend-a")).unwrap();
        assert_eq!(snap.health, HealthState::Healthy);
    }

    #[test]
    fn test_non_counting_failures_do_not_trip_closed_circuit() {
        let (map, _registry) = breakers(1, Duration::from_secs(60));
        map.record_failure("backend-a", false);
        map.record_failure("backend-a", false);
        assert_eq!(map.state_of("backend-a"), Some("closed"));
        assert!(map.preflight("backend-a").is_ok());
    }

    #[test]
    fn test_probe_failing_on_non_counting_fault_reopens() {
        let (map, _registry) = breakers(1, Duration::from_millis(10));
        map.record_failure("backend-a", true);
        std::thread::sleep(Duration::from_millis(20));
        assert!(map.preflight("backend-a").is_ok());
        assert_eq!(map.state_of("backend-a"), Some("halfOpen"));

        // the probe dies on a client-side fault: the cell must not stay
        // half-open with its probe slot taken
        map.record_failure("backend-a", false);
        assert_eq!(map.state_of("backend-a"), Some("open"));
        assert!(matches!(
            map.preflight("backend-a"),
            Err(CoreError::CircuitOpen(_))
        ));

        // after another timeout a fresh probe is admitted
        std::thread::sleep(Duration::from_millis(20));
        assert!(map.preflight("backend-a").is_ok());
        assert_eq!(map.state_of("backend-a"), Some("halfOpen"));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (map, _registry) = breakers(1, Duration::from_millis(10));
        map.record_failure("backend-a", true);
        std::thread::sleep(Duration::from_millis(20));
        assert!(map.preflight("backend-a").is_ok());

        map.record_failure("backend-a", true);
        assert_eq!(map.state_of("backend-a"), Some("open"));
        assert!(matches!(
            map.preflight("backend-a"),
            Err(CoreError::CircuitOpen(_))
        ));
    }

    #[test]
    fn test_window_expiry_resets_failures() {
        let registry = AgentRegistry::new();
        let settings = BreakerSettings {
            threshold: 2,
            window: Duration::from_millis(10),
            timeout: Duration::from_secs(60),
        };
        let map = BreakerMap::new(settings, EventBus::new(64), registry);

        map.record_failure("k", true);
        std::thread::sleep(Duration::from_millis(20));
        map.record_failure("k", true);
        // first failure aged out of the window
        assert_eq!(map.state_of("k"), Some("closed"));
    }

    #[test]
    fn test_breakers_are_independent_per_key() {
        let (map, _registry) = breakers(1, Duration::from_secs(60));
        map.record_failure("backend-a", true);
        assert_eq!(map.state_of("backend-a"), Some("open"));
        assert!(map.preflight("backend-b").is_ok());
    }
}
