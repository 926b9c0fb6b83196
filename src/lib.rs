//! Request routing core for brokering LLM traffic across heterogeneous
//! providers.
//!
//! Every submitted request flows through a five-stage pipeline: the
//! preprocessor validates and normalizes it, the router picks a backend under
//! cost, latency, capability, and quality constraints, the batcher groups
//! compatible work and dispatches it under a concurrency bound, the executor
//! invokes the backend with retries and per-backend circuit breaking, and the
//! response processor transforms and quality-scores the result. A fingerprint
//! cache short-circuits repeated deterministic requests, and every stage
//! publishes structured events on a shared bus.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use conflux::{
//!     AgentKind, AgentProfile, AgentRegistry, CoreConfig, InMemoryKVStore, MockProvider,
//!     Request, RequestType, RoutingCore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Register the routable backends
//!     let registry = AgentRegistry::new();
//!     registry.register(
//!         AgentProfile::new("hosted-a/general", AgentKind::Provider, "hosted-a")
//!             .with_capability("text", 0.9)
//!             .with_capability("chat", 0.8),
//!         Arc::new(MockProvider::new()),
//!     );
//!
//!     // Build and start the core
//!     let core = RoutingCore::new(CoreConfig::default(), registry, InMemoryKVStore::new())?;
//!
//!     // Submit a request and await the processed response
//!     let response = core
//!         .submit(Request::new("acme", RequestType::Text, "Summarize: hello world"))
//!         .await?;
//!     println!("{} (quality {:.1})", response.content, response.quality_score);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod execute;
pub mod pipeline;
pub mod preprocess;
pub mod provider;
pub mod registry;
pub mod respond;
pub mod router;
pub mod types;

// Re-export the types most users touch at the crate root: the core facade,
// the provider contract, registry types, configuration, and the data model.
pub use batch::BatchStrategy;
pub use cache::{InMemoryKVStore, KVStore};
pub use config::{CoreConfig, PreprocessorConfig, SafetyRule, TenantPolicies, TenantPolicy};
pub use error::{CoreError, ErrorKind, ProviderError, Result};
pub use events::{BusItem, Event, EventBus, EventKind, EventSeverity, EventStream};
pub use execute::recovery::ErrorPattern;
pub use pipeline::{CoreStatus, RoutingCore, StreamingSubmission};
pub use provider::{HealthReport, MockProvider, PreparedCall, Provider, RawResult};
pub use registry::{
    AgentKind, AgentProfile, AgentRegistry, AgentSnapshot, HealthState, Observation,
};
pub use respond::{HeuristicScorer, QualityScorer};
pub use router::{RouteContext, RouteStrategy, Router, Selection, default_strategies};
pub use types::{
    AgentId, Attachment, AttemptOutcome, BatchId, ChunkKind, ExecutionAttempt, Fingerprint,
    Preferences, PreprocessedRequest, Priority, ProcessedResponse, Request, RequestId,
    RequestType, RoutingDecision, StreamChunk, TenantTier, TokenEstimate, Usage,
};
