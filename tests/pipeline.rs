//! End-to-end scenarios through the assembled routing core.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_stream::StreamExt;

use conflux::{
    AgentKind, AgentProfile, AgentRegistry, CoreConfig, CoreError, EventKind, InMemoryKVStore,
    MockProvider, Priority, ProviderError, RawResult, Request, RequestType, RoutingCore,
    TenantPolicy, TenantTier,
};

struct TestCore {
    core: Arc<RoutingCore>,
    provider: Arc<MockProvider>,
}

fn fast_config() -> CoreConfig {
    CoreConfig {
        max_wait_time_ms: 200,
        batch_flush_interval_ms: 5,
        base_retry_delay_ms: 50,
        max_retry_delay_ms: 200,
        retry_jitter: false,
        attempt_safety_margin_ms: 0,
        ..Default::default()
    }
}

fn build_core(config: CoreConfig) -> TestCore {
    build_core_with(config, MockProvider::new())
}

fn build_core_with(config: CoreConfig, provider: MockProvider) -> TestCore {
    let registry = AgentRegistry::new();
    let provider = Arc::new(provider);
    registry.register(
        AgentProfile::new("primary", AgentKind::Provider, "hosted-a")
            .with_capability("text", 0.9)
            .with_capability("chat", 0.8),
        provider.clone(),
    );
    let core = RoutingCore::new(config, registry, InMemoryKVStore::new()).unwrap();
    TestCore { core, provider }
}

/// Drain every event currently buffered on the stream.
async fn drain_events(events: &mut conflux::EventStream) -> Vec<conflux::Event> {
    let mut out = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(50), events.recv_event()).await
    {
        out.push(event);
    }
    out
}

fn count(events: &[conflux::Event], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

// A plain submission flows through routing, execution, and scoring.
#[test_log::test(tokio::test)]
async fn happy_path_routes_executes_and_scores() {
    let t = build_core(fast_config());
    // a paying tenant so routing lands on the load balancer, not cost optimization
    t.core.policies().set(
        "acme",
        TenantPolicy {
            tier: TenantTier::Pro,
            ..Default::default()
        },
    );
    let mut events = t.core.events();

    let response = t
        .core
        .submit(Request::new(
            "acme",
            RequestType::Text,
            "Summarize: hello world",
        ))
        .await
        .unwrap();

    assert!(response.success);
    assert!(!response.cached);
    assert!(!response.degraded);
    assert!(response.quality_score >= 5.0);

    let seen = drain_events(&mut events).await;
    assert_eq!(count(&seen, EventKind::RequestPreprocessed), 1);
    assert_eq!(count(&seen, EventKind::AttemptSucceeded), 1);
    assert_eq!(count(&seen, EventKind::ResponseProcessed), 1);
    let routing: Vec<_> = seen
        .iter()
        .filter(|e| e.kind == EventKind::RoutingSuccess)
        .collect();
    assert_eq!(routing.len(), 1);
    assert_eq!(routing[0].payload["strategy"], "loadBalanced");
}

// An identical deterministic request is served from the cache.
#[tokio::test]
async fn cache_hit_skips_the_backend() {
    let t = build_core(fast_config());

    let mut request = Request::new("acme", RequestType::Text, "deterministic question");
    request
        .parameters
        .insert("temperature".into(), serde_json::json!(0));

    let first = t.core.submit(request.clone()).await.unwrap();
    assert!(!first.cached);
    assert_eq!(t.provider.call_count(), 1);

    let mut events = t.core.events();
    let mut second_request = Request::new("acme", RequestType::Text, "deterministic question");
    second_request
        .parameters
        .insert("temperature".into(), serde_json::json!(0));
    let second = t.core.submit(second_request).await.unwrap();

    assert!(second.cached);
    assert_eq!(t.provider.call_count(), 1, "no second backend call");

    // identical modulo the cached flag
    let mut normalized = second.clone();
    normalized.cached = false;
    assert_eq!(normalized, first);

    let seen = drain_events(&mut events).await;
    assert!(count(&seen, EventKind::CacheHit) >= 1);
    assert_eq!(count(&seen, EventKind::AttemptStarted), 0);
    assert_eq!(count(&seen, EventKind::AttemptSucceeded), 0);
}

// A retryable failure is retried with backoff and then succeeds.
#[tokio::test]
async fn retry_then_succeed() {
    let t = build_core(fast_config());
    t.provider
        .add_response(Err(ProviderError::retryable("503 upstream")));
    t.provider
        .add_response(Ok(RawResult::text("recovered answer.")));
    let mut events = t.core.events();

    let started = std::time::Instant::now();
    let response = t
        .core
        .submit(Request::new("acme", RequestType::Text, "please recover"))
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.content, "recovered answer.");
    // total latency includes the base retry delay
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(t.provider.call_count(), 2);

    let seen = drain_events(&mut events).await;
    let failed: Vec<_> = seen
        .iter()
        .filter(|e| e.kind == EventKind::AttemptFailed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].payload["attempt"], 1);
    assert_eq!(failed[0].payload["error_kind"], "retryable");
    let succeeded: Vec<_> = seen
        .iter()
        .filter(|e| e.kind == EventKind::AttemptSucceeded)
        .collect();
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0].payload["attempt"], 2);
}

// Consecutive server faults open the circuit; it probes and recloses.
#[test_log::test(tokio::test)]
async fn breaker_lifecycle_through_the_pipeline() {
    let mut config = fast_config();
    config.breaker_threshold = 3;
    config.breaker_timeout_ms = 200;
    config.degradation_enabled = false;
    let t = build_core(config);
    let mut events = t.core.events();

    for _ in 0..3 {
        t.provider
            .add_response(Err(ProviderError::fatal_server("500")));
    }

    // three consecutive server faults trip the breaker
    for _ in 0..3 {
        let err = t
            .core
            .submit(Request::new("acme", RequestType::Text, "will fail"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BackendFatal(_)));
    }
    assert_eq!(t.provider.call_count(), 3);

    // within the breaker timeout: refused fail-fast, no backend call
    let err = t
        .core
        .submit(Request::new("acme", RequestType::Text, "too soon"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::CircuitOpen(_)));
    assert_eq!(t.provider.call_count(), 3);

    // after the timeout the next request becomes the probe and closes the
    // circuit (the mock echoes once its script is exhausted)
    tokio::time::sleep(Duration::from_millis(250)).await;
    let response = t
        .core
        .submit(Request::new("acme", RequestType::Text, "probe me"))
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(t.provider.call_count(), 4);

    let seen = drain_events(&mut events).await;
    assert_eq!(count(&seen, EventKind::BreakerOpen), 1);
    assert_eq!(count(&seen, EventKind::BreakerHalfOpen), 1);
    assert_eq!(count(&seen, EventKind::BreakerClosed), 1);
}

// Similar requests batch together and complete in submission order.
#[tokio::test]
async fn batching_preserves_submission_order() {
    let mut config = fast_config();
    config.max_batch_size = 10;
    config.max_wait_time_ms = 1000;
    let t = build_core(config);
    let mut events = t.core.events();

    let mut futures = Vec::new();
    for index in 0..5 {
        let mut request = Request::new("acme", RequestType::Text, format!("batch-{index}"));
        request.priority = Priority::Low;
        request
            .parameters
            .insert("style".into(), serde_json::json!("brief"));
        futures.push(t.core.submit(request));
    }
    let results = join_all(futures).await;
    for result in &results {
        assert!(result.as_ref().unwrap().success);
    }

    // members executed in submission order
    let calls = t.provider.calls();
    assert_eq!(calls.len(), 5);
    for (index, call) in calls.iter().enumerate() {
        assert_eq!(call.content, format!("batch-{index}"));
    }

    let seen = drain_events(&mut events).await;
    let scheduled: Vec<_> = seen
        .iter()
        .filter(|e| e.kind == EventKind::BatchScheduled)
        .collect();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].payload["members"], 5);
    assert_eq!(scheduled[0].payload["strategy"], "similarity");
    assert_eq!(count(&seen, EventKind::BatchCompleted), 1);
    assert_eq!(count(&seen, EventKind::BatchFailed), 0);
}

// Cancelling a forming request never reaches a backend.
#[tokio::test]
async fn cancel_while_forming() {
    let mut config = fast_config();
    config.max_wait_time_ms = 60_000; // hold the forming batch open
    let t = build_core(config);
    let mut events = t.core.events();

    let mut request = Request::new("acme", RequestType::Text, "cancel me");
    request.priority = Priority::Low;
    let id = request.id;

    let core = t.core.clone();
    let submission = tokio::spawn(async move { core.submit(request).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(t.core.cancel(id));

    let outcome = submission.await.unwrap();
    assert!(matches!(outcome, Err(CoreError::Cancelled)));
    assert_eq!(t.provider.call_count(), 0);

    let seen = drain_events(&mut events).await;
    assert_eq!(count(&seen, EventKind::AttemptStarted), 0);
    assert_eq!(count(&seen, EventKind::AttemptSucceeded), 0);
}

// Concurrent identical requests coalesce into a single build.
#[tokio::test]
async fn concurrent_identical_requests_share_one_build() {
    let t = build_core(fast_config());

    let mut futures = Vec::new();
    for _ in 0..3 {
        let mut request = Request::new("acme", RequestType::Text, "same deterministic ask");
        request
            .parameters
            .insert("temperature".into(), serde_json::json!(0));
        futures.push(t.core.submit(request));
    }
    let results = join_all(futures).await;

    let contents: Vec<String> = results
        .into_iter()
        .map(|r| r.unwrap().content)
        .collect();
    assert!(contents.iter().all(|c| c == &contents[0]));
    assert_eq!(t.provider.call_count(), 1, "exactly one builder executed");
}

// A cache entry expires after its TTL and rebuilds identically.
#[tokio::test]
async fn cache_ttl_round_trip() {
    let mut config = fast_config();
    config.cache_ttl_secs = 1;
    let t = build_core(config);

    let make_request = || {
        let mut request = Request::new("acme", RequestType::Text, "ttl bound ask");
        request
            .parameters
            .insert("temperature".into(), serde_json::json!(0));
        request
    };

    let first = t.core.submit(make_request()).await.unwrap();
    let hit = t.core.submit(make_request()).await.unwrap();
    assert!(hit.cached);
    assert_eq!(t.provider.call_count(), 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let rebuilt = t.core.submit(make_request()).await.unwrap();
    assert!(!rebuilt.cached);
    assert_eq!(t.provider.call_count(), 2);
    assert_eq!(rebuilt.content, first.content);

    let hit_again = t.core.submit(make_request()).await.unwrap();
    assert!(hit_again.cached);
    assert_eq!(hit_again.content, first.content);
}

// Submissions are refused above the high-water mark and resume after draining.
#[tokio::test]
async fn overload_sheds_submissions() {
    let mut config = fast_config();
    config.high_water = 1;
    config.low_water = 0;
    config.min_batch_size = 1;
    config.max_wait_time_ms = 50;
    let t = build_core_with(config, MockProvider::new().with_delay(Duration::from_millis(300)));

    let mut slow = Request::new("acme", RequestType::Text, "slow one");
    slow.priority = Priority::Urgent; // dispatches immediately, occupying the pipeline
    let core = t.core.clone();
    let first = tokio::spawn(async move { core.submit(slow).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = t
        .core
        .submit(Request::new("acme", RequestType::Text, "rejected"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Overloaded));

    assert!(first.await.unwrap().is_ok());

    // drained below the low-water mark: submissions flow again
    let response = t
        .core
        .submit(Request::new("acme", RequestType::Text, "accepted"))
        .await
        .unwrap();
    assert!(response.success);
}

// Streaming submissions deliver chunks and then the processed response.
#[tokio::test]
async fn streaming_submission_yields_chunks_and_response() {
    let t = build_core(fast_config());
    t.provider
        .add_response(Ok(RawResult::text("streamed answer.")));

    let mut request = Request::new("acme", RequestType::Chat, "stream this");
    request.priority = Priority::Urgent;
    let submission = t.core.submit_streaming(request).await.unwrap();

    let chunks: Vec<_> = submission.chunks.collect().await;
    assert!(
        chunks
            .iter()
            .any(|c| c.kind == conflux::ChunkKind::Content && c.data == "streamed answer.")
    );
    assert_eq!(chunks.last().unwrap().kind, conflux::ChunkKind::Done);

    let response = submission.response.await.unwrap().unwrap();
    assert!(response.streaming);
    assert_eq!(response.content, "streamed answer.");
}

// Exhausted recovery yields a clearly labeled degraded response.
#[tokio::test]
async fn degraded_response_when_backends_exhausted() {
    let mut config = fast_config();
    config.max_retries = 1;
    config.base_retry_delay_ms = 5;
    let t = build_core(config);
    for _ in 0..4 {
        t.provider
            .add_response(Err(ProviderError::retryable("hard down")));
    }
    let mut events = t.core.events();

    let response = t
        .core
        .submit(Request::new("acme", RequestType::Text, "degrade me"))
        .await
        .unwrap();

    assert!(response.degraded);
    assert!(response.quality_score <= 5.0);
    assert!(response.warnings.iter().any(|w| w.contains("degraded")));

    let seen = drain_events(&mut events).await;
    assert!(count(&seen, EventKind::ResponseDegraded) >= 1);
}

// Validation and policy failures surface directly
#[tokio::test]
async fn preprocessor_failures_surface_to_caller() {
    let t = build_core(fast_config());

    let empty = t
        .core
        .submit(Request::new("acme", RequestType::Text, "   "))
        .await
        .unwrap_err();
    assert!(matches!(empty, CoreError::Validation(_)));

    let leaked = t
        .core
        .submit(Request::new(
            "acme",
            RequestType::Text,
            "my password: hunter2 is leaking",
        ))
        .await
        .unwrap_err();
    assert!(matches!(leaked, CoreError::PolicyRejection(_)));

    assert_eq!(t.provider.call_count(), 0);
}
