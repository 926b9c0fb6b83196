//! Idempotent result cache keyed by request fingerprint.
//!
//! The cache sits behind a `KVStore` trait so the backing store can be an
//! external KV service in production and an in-memory map in tests. Builds
//! are coalesced: at most one builder is active per fingerprint, and every
//! concurrent waiter observes the builder's result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::broadcast;

use crate::error::{CoreError, Result};
use crate::events::{EventBus, EventKind};
use crate::types::{PreprocessedRequest, ProcessedResponse};

/// Collaborator interface to the backing key-value store.
#[async_trait]
pub trait KVStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;
    /// Atomic insert-if-absent; returns whether the value was inserted.
    async fn set_if_absent(&self, key: &str, value: String, ttl: Option<Duration>)
    -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryKVStore {
    entries: DashMap<String, StoredValue>,
}

impl InMemoryKVStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KVStore for InMemoryKVStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expired(now) {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|t| Utc::now() + chrono::Duration::from_std(t).unwrap_or_default());
        self.entries
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = Utc::now();
        let expires_at = ttl.map(|t| now + chrono::Duration::from_std(t).unwrap_or_default());
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().expired(now) {
                    occupied.insert(StoredValue { value, expires_at });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(StoredValue { value, expires_at });
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

type BuildResult = std::result::Result<ProcessedResponse, String>;

/// What a cache lookup resolved to.
pub enum CacheOutcome {
    /// Request is not cacheable; proceed without the cache.
    Bypass,
    /// A stored response was found (already marked `cached`).
    Hit(Box<ProcessedResponse>),
    /// Another task is building this fingerprint; await its result.
    Join(broadcast::Receiver<BuildResult>),
    /// This task is the builder; fulfill the guard when done.
    Build(BuildGuard),
}

/// Held by the single active builder for a fingerprint.
///
/// Dropping the guard without completing it releases waiting tasks with a
/// failure so they never hang.
pub struct BuildGuard {
    key: String,
    tx: broadcast::Sender<BuildResult>,
    store: Arc<dyn KVStore>,
    inflight: Arc<DashMap<String, broadcast::Sender<BuildResult>>>,
    ttl: Duration,
    completed: bool,
}

impl BuildGuard {
    /// Publish a successful build to the store and all waiters.
    pub async fn complete(mut self, response: &ProcessedResponse) {
        self.completed = true;
        self.inflight.remove(&self.key);
        match serde_json::to_string(response) {
            Ok(serialized) => {
                if let Err(error) = self
                    .store
                    .set(&self.key, serialized, Some(self.ttl))
                    .await
                {
                    tracing::warn!(key = %self.key, error = %error, "Failed to store cached response");
                }
            }
            Err(error) => {
                tracing::warn!(key = %self.key, error = %error, "Failed to serialize response for cache");
            }
        }
        let _ = self.tx.send(Ok(response.clone()));
    }

    /// Propagate a build failure to all waiters. Nothing is stored.
    pub fn fail(mut self, error: &CoreError) {
        self.completed = true;
        self.inflight.remove(&self.key);
        let _ = self.tx.send(Err(error.to_string()));
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.inflight.remove(&self.key);
            let _ = self.tx.send(Err("builder aborted".to_string()));
        }
    }
}

/// Fingerprint-keyed response cache with single-flight builds.
pub struct ResponseCache {
    store: Arc<dyn KVStore>,
    inflight: Arc<DashMap<String, broadcast::Sender<BuildResult>>>,
    ttl: Duration,
    bus: Arc<EventBus>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KVStore>, ttl: Duration, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            store,
            inflight: Arc::new(DashMap::new()),
            ttl,
            bus,
        })
    }

    /// Whether a request's result may be cached: deterministic type, no
    /// user-specific context, and an explicit zero sampling temperature.
    pub fn cacheable(prep: &PreprocessedRequest) -> bool {
        let request = &prep.request;
        if !request.kind.is_deterministic() {
            return false;
        }
        if request.user_id.is_some() || request.session_id.is_some() {
            return false;
        }
        matches!(
            request.parameters.get("temperature"),
            Some(serde_json::Value::Number(n)) if n.as_f64() == Some(0.0)
        )
    }

    /// Resolve a lookup for the given request.
    pub async fn lookup(&self, prep: &PreprocessedRequest) -> Result<CacheOutcome> {
        if !Self::cacheable(prep) {
            return Ok(CacheOutcome::Bypass);
        }

        let key = cache_key(&prep.request.tenant_id, prep.fingerprint.as_str());

        if let Some(serialized) = self.store.get(&key).await? {
            match serde_json::from_str::<ProcessedResponse>(&serialized) {
                Ok(mut response) => {
                    response.cached = true;
                    self.bus.publish(
                        EventKind::CacheHit,
                        Some(prep.id()),
                        json!({"fingerprint": prep.fingerprint.as_str()}),
                    );
                    metrics::counter!("conflux_cache_hits_total").increment(1);
                    return Ok(CacheOutcome::Hit(Box::new(response)));
                }
                Err(error) => {
                    // Poisoned entry; drop it and rebuild.
                    tracing::warn!(key = %key, error = %error, "Evicting undecodable cache entry");
                    self.store.delete(&key).await?;
                }
            }
        }

        // One builder per key; losers of the race subscribe to the winner.
        match self.inflight.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                let rx = occupied.get().subscribe();
                self.bus.publish(
                    EventKind::CacheHit,
                    Some(prep.id()),
                    json!({"fingerprint": prep.fingerprint.as_str(), "coalesced": true}),
                );
                Ok(CacheOutcome::Join(rx))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, _) = broadcast::channel(1);
                vacant.insert(tx.clone());
                self.bus.publish(
                    EventKind::CacheMiss,
                    Some(prep.id()),
                    json!({"fingerprint": prep.fingerprint.as_str()}),
                );
                metrics::counter!("conflux_cache_misses_total").increment(1);
                Ok(CacheOutcome::Build(BuildGuard {
                    key,
                    tx,
                    store: self.store.clone(),
                    inflight: self.inflight.clone(),
                    ttl: self.ttl,
                    completed: false,
                }))
            }
        }
    }

    /// Await the in-flight builder's result.
    pub async fn join(mut rx: broadcast::Receiver<BuildResult>) -> Result<ProcessedResponse> {
        match rx.recv().await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(message)) => Err(CoreError::Internal(anyhow::anyhow!(
                "shared cache build failed: {message}"
            ))),
            Err(_) => Err(CoreError::Internal(anyhow::anyhow!(
                "cache builder disappeared"
            ))),
        }
    }

    /// Number of fingerprints currently being built.
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

fn cache_key(tenant_id: &str, fingerprint: &str) -> String {
    format!("conflux:{tenant_id}:{fingerprint}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fingerprint, Request, RequestType, TokenEstimate};
    use chrono::Utc;

    fn prep(tenant: &str, kind: RequestType, temperature: Option<f64>) -> PreprocessedRequest {
        let mut request = Request::new(tenant, kind, "deterministic question");
        if let Some(t) = temperature {
            request
                .parameters
                .insert("temperature".into(), serde_json::json!(t));
        }
        PreprocessedRequest {
            request,
            risk_score: 0,
            effective_priority: 4,
            estimated_tokens: TokenEstimate { input: 10, output: 100 },
            estimated_cost: 0.001,
            transformations: Vec::new(),
            fingerprint: Fingerprint::from_hex("abc123".into()),
            validation_passed: true,
        }
    }

    fn response(prep: &PreprocessedRequest) -> ProcessedResponse {
        ProcessedResponse {
            request_id: prep.id(),
            success: true,
            content: "answer".into(),
            warnings: Vec::new(),
            quality_score: 7.0,
            usage: Default::default(),
            transformations: Vec::new(),
            streaming: false,
            cached: false,
            degraded: false,
            produced_at: Utc::now(),
        }
    }

    fn cache() -> Arc<ResponseCache> {
        ResponseCache::new(
            InMemoryKVStore::new(),
            Duration::from_secs(60),
            EventBus::new(64),
        )
    }

    #[test]
    fn test_cacheability_rules() {
        assert!(ResponseCache::cacheable(&prep("t", RequestType::Text, Some(0.0))));
        assert!(!ResponseCache::cacheable(&prep("t", RequestType::Text, Some(0.7))));
        assert!(!ResponseCache::cacheable(&prep("t", RequestType::Text, None)));
        assert!(!ResponseCache::cacheable(&prep("t", RequestType::Chat, Some(0.0))));

        let mut with_user = prep("t", RequestType::Text, Some(0.0));
        with_user.request.user_id = Some("u1".into());
        assert!(!ResponseCache::cacheable(&with_user));
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = cache();
        let p = prep("acme", RequestType::Text, Some(0.0));

        let outcome = cache.lookup(&p).await.unwrap();
        let guard = match outcome {
            CacheOutcome::Build(guard) => guard,
            _ => panic!("expected build"),
        };
        let resp = response(&p);
        guard.complete(&resp).await;

        match cache.lookup(&p).await.unwrap() {
            CacheOutcome::Hit(hit) => {
                assert!(hit.cached);
                assert_eq!(hit.content, resp.content);
            }
            _ => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn test_tenant_namespacing() {
        let cache = cache();
        let p1 = prep("acme", RequestType::Text, Some(0.0));
        let p2 = prep("globex", RequestType::Text, Some(0.0));

        let guard = match cache.lookup(&p1).await.unwrap() {
            CacheOutcome::Build(guard) => guard,
            _ => panic!("expected build"),
        };
        guard.complete(&response(&p1)).await;

        // same fingerprint, different tenant: still a miss
        match cache.lookup(&p2).await.unwrap() {
            CacheOutcome::Build(_) => {}
            _ => panic!("expected build for other tenant"),
        }
    }

    #[tokio::test]
    async fn test_single_builder_many_waiters() {
        let cache = cache();
        let p = prep("acme", RequestType::Text, Some(0.0));

        let guard = match cache.lookup(&p).await.unwrap() {
            CacheOutcome::Build(guard) => guard,
            _ => panic!("expected build"),
        };

        let rx1 = match cache.lookup(&p).await.unwrap() {
            CacheOutcome::Join(rx) => rx,
            _ => panic!("expected join"),
        };
        let rx2 = match cache.lookup(&p).await.unwrap() {
            CacheOutcome::Join(rx) => rx,
            _ => panic!("expected join"),
        };
        assert_eq!(cache.inflight_count(), 1);

        let resp = response(&p);
        let expected = resp.content.clone();
        guard.complete(&resp).await;

        let got1 = ResponseCache::join(rx1).await.unwrap();
        let got2 = ResponseCache::join(rx2).await.unwrap();
        assert_eq!(got1.content, expected);
        assert_eq!(got2.content, expected);
        assert_eq!(cache.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_builder_releases_waiters() {
        let cache = cache();
        let p = prep("acme", RequestType::Text, Some(0.0));

        let guard = match cache.lookup(&p).await.unwrap() {
            CacheOutcome::Build(guard) => guard,
            _ => panic!("expected build"),
        };
        let rx = match cache.lookup(&p).await.unwrap() {
            CacheOutcome::Join(rx) => rx,
            _ => panic!("expected join"),
        };

        drop(guard);
        assert!(ResponseCache::join(rx).await.is_err());
        assert_eq!(cache.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = InMemoryKVStore::new();
        store
            .set("k", "v".into(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);

        // expired slot can be re-claimed by set_if_absent
        store
            .set("k2", "a".into(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.set_if_absent("k2", "b".into(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_if_absent_respects_existing() {
        let store = InMemoryKVStore::new();
        assert!(store.set_if_absent("k", "a".into(), None).await.unwrap());
        assert!(!store.set_if_absent("k", "b".into(), None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("a".to_string()));
    }
}
