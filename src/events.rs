//! Typed event bus for pipeline observability.
//!
//! Every stage publishes structured events under stable names. The bus is a
//! bounded broadcast channel: publishing never blocks the pipeline, and under
//! pressure the bus sheds low-severity events first. Subscribers that fall
//! behind observe a lag marker rather than stalling publishers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::RequestId;

/// Every event kind the core emits, with its stable wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "request.preprocessed")]
    RequestPreprocessed,
    #[serde(rename = "request.rejected")]
    RequestRejected,
    #[serde(rename = "routing.success")]
    RoutingSuccess,
    #[serde(rename = "routing.fallback")]
    RoutingFallback,
    #[serde(rename = "routing.failed")]
    RoutingFailed,
    #[serde(rename = "batch.formed")]
    BatchFormed,
    #[serde(rename = "batch.scheduled")]
    BatchScheduled,
    #[serde(rename = "batch.completed")]
    BatchCompleted,
    #[serde(rename = "batch.failed")]
    BatchFailed,
    #[serde(rename = "attempt.started")]
    AttemptStarted,
    #[serde(rename = "attempt.succeeded")]
    AttemptSucceeded,
    #[serde(rename = "attempt.failed")]
    AttemptFailed,
    #[serde(rename = "breaker.open")]
    BreakerOpen,
    #[serde(rename = "breaker.halfOpen")]
    BreakerHalfOpen,
    #[serde(rename = "breaker.closed")]
    BreakerClosed,
    #[serde(rename = "response.processed")]
    ResponseProcessed,
    #[serde(rename = "response.cached")]
    ResponseCached,
    #[serde(rename = "response.degraded")]
    ResponseDegraded,
    #[serde(rename = "cache.hit")]
    CacheHit,
    #[serde(rename = "cache.miss")]
    CacheMiss,
}

impl EventKind {
    /// The stable dotted name used on the wire and in metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RequestPreprocessed => "request.preprocessed",
            EventKind::RequestRejected => "request.rejected",
            EventKind::RoutingSuccess => "routing.success",
            EventKind::RoutingFallback => "routing.fallback",
            EventKind::RoutingFailed => "routing.failed",
            EventKind::BatchFormed => "batch.formed",
            EventKind::BatchScheduled => "batch.scheduled",
            EventKind::BatchCompleted => "batch.completed",
            EventKind::BatchFailed => "batch.failed",
            EventKind::AttemptStarted => "attempt.started",
            EventKind::AttemptSucceeded => "attempt.succeeded",
            EventKind::AttemptFailed => "attempt.failed",
            EventKind::BreakerOpen => "breaker.open",
            EventKind::BreakerHalfOpen => "breaker.halfOpen",
            EventKind::BreakerClosed => "breaker.closed",
            EventKind::ResponseProcessed => "response.processed",
            EventKind::ResponseCached => "response.cached",
            EventKind::ResponseDegraded => "response.degraded",
            EventKind::CacheHit => "cache.hit",
            EventKind::CacheMiss => "cache.miss",
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            EventKind::AttemptStarted
            | EventKind::CacheHit
            | EventKind::CacheMiss
            | EventKind::BatchFormed => EventSeverity::Debug,

            EventKind::RequestRejected
            | EventKind::RoutingFailed
            | EventKind::BatchFailed
            | EventKind::AttemptFailed
            | EventKind::BreakerOpen
            | EventKind::ResponseDegraded => EventSeverity::Warn,

            _ => EventSeverity::Info,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity band used for load shedding; lowest severity is dropped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warn,
}

/// A structured event with an optional request correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub request_id: Option<RequestId>,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Items yielded to subscribers.
#[derive(Debug, Clone)]
pub enum BusItem {
    Event(Event),
    /// The subscriber fell behind and `skipped` events were discarded.
    Lagged(u64),
}

/// Append-only, lossy event bus.
///
/// Publishing is non-blocking. When the channel fills past three quarters the
/// bus stops accepting `Debug`-severity events; past nine tenths it also
/// sheds `Info`. `Warn` events are always published.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Arc::new(Self {
            tx,
            capacity: capacity.max(16),
            dropped: AtomicU64::new(0),
        })
    }

    /// Publish an event. Never blocks; may shed under pressure.
    pub fn publish(
        &self,
        kind: EventKind,
        request_id: Option<RequestId>,
        payload: serde_json::Value,
    ) {
        metrics::counter!("conflux_events_total", "kind" => kind.as_str()).increment(1);

        if kind.severity() < self.severity_floor() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("conflux_events_dropped_total").increment(1);
            return;
        }

        let event = Event {
            kind,
            request_id,
            payload,
            at: Utc::now(),
        };

        // send only fails when there are no subscribers; that is not a loss.
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events from this point forward.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of events shed at publish time due to pressure.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn severity_floor(&self) -> EventSeverity {
        let queued = self.tx.len();
        if queued >= self.capacity * 9 / 10 {
            EventSeverity::Warn
        } else if queued >= self.capacity * 3 / 4 {
            EventSeverity::Info
        } else {
            EventSeverity::Debug
        }
    }
}

/// A subscription handle over the bus.
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
}

impl EventStream {
    /// Receive the next item. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusItem> {
        match self.rx.recv().await {
            Ok(event) => Some(BusItem::Event(event)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Some(BusItem::Lagged(skipped)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Receive the next event, skipping lag markers. Test convenience.
    pub async fn recv_event(&mut self) -> Option<Event> {
        loop {
            match self.recv().await? {
                BusItem::Event(event) => return Some(event),
                BusItem::Lagged(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new(64);
        let mut sub = bus.subscribe();

        let id = RequestId::new();
        bus.publish(EventKind::RoutingSuccess, Some(id), json!({"agent": "a"}));

        let event = sub.recv_event().await.unwrap();
        assert_eq!(event.kind, EventKind::RoutingSuccess);
        assert_eq!(event.request_id, Some(id));
        assert_eq!(event.payload["agent"], "a");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::new(16);
        bus.publish(EventKind::CacheMiss, None, json!({}));
        assert_eq!(bus.dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_sees_lag_marker() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();

        for _ in 0..40 {
            bus.publish(EventKind::BreakerOpen, None, json!({}));
        }

        match sub.recv().await.unwrap() {
            BusItem::Lagged(skipped) => assert!(skipped > 0),
            BusItem::Event(_) => panic!("expected lag marker first"),
        }
    }

    #[test]
    fn test_wire_names_are_stable() {
        assert_eq!(EventKind::BreakerHalfOpen.as_str(), "breaker.halfOpen");
        assert_eq!(EventKind::RequestPreprocessed.as_str(), "request.preprocessed");
        let json = serde_json::to_string(&EventKind::CacheHit).unwrap();
        assert_eq!(json, "\"cache.hit\"");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(EventSeverity::Debug < EventSeverity::Info);
        assert!(EventSeverity::Info < EventSeverity::Warn);
        assert_eq!(EventKind::AttemptStarted.severity(), EventSeverity::Debug);
        assert_eq!(EventKind::BreakerOpen.severity(), EventSeverity::Warn);
    }
}
