//! Batch formation and priority dispatch.
//!
//! Compatible requests are grouped into forming batches under a strategy
//! ladder (emergency bypass, parameter similarity, shared backend, shared
//! priority, temporal window). Sealed batches enter a priority-ordered queue
//! drained by a dispatcher whose concurrency is bounded by a semaphore.
//! Members of a running batch execute sequentially in submission order.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Notify, Semaphore, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::events::{EventBus, EventKind};
use crate::execute::Executor;
use crate::registry::Observation;
use crate::respond::{ResponseMeta, ResponseProcessor};
use crate::types::{
    BatchId, PreprocessedRequest, Priority, ProcessedResponse, RequestId, RoutingDecision,
    StreamChunk,
};

/// Window within which members are considered temporally adjacent, milliseconds.
const TEMPORAL_WINDOW_MS: i64 = 5_000;

/// Parameter-key Jaccard similarity floor for the similarity strategy.
const SIMILARITY_FLOOR: f64 = 0.6;

/// How a batch came to be grouped, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    Emergency,
    Similarity,
    Backend,
    Priority,
    Temporal,
}

impl BatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStrategy::Emergency => "emergency",
            BatchStrategy::Similarity => "similarity",
            BatchStrategy::Backend => "backend",
            BatchStrategy::Priority => "priority",
            BatchStrategy::Temporal => "temporal",
        }
    }
}

/// One request waiting for execution, with its completion channel.
struct Member {
    prep: PreprocessedRequest,
    decision: RoutingDecision,
    responder: oneshot::Sender<Result<ProcessedResponse>>,
    stream_tx: Option<mpsc::Sender<StreamChunk>>,
    cancelled: Arc<AtomicBool>,
    seq: u64,
}

impl Member {
    fn id(&self) -> RequestId {
        self.prep.id()
    }
}

/// A batch still accepting members.
struct FormingBatch {
    id: BatchId,
    strategy: BatchStrategy,
    members: Vec<Member>,
    deadline: Instant,
}

/// A sealed batch waiting in the dispatch queue.
struct QueuedJob {
    id: BatchId,
    strategy: BatchStrategy,
    members: Vec<Member>,
    priority: u8,
    seq: u64,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // max-heap: higher priority first, FIFO within a priority level
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Groups compatible requests and dispatches them under a concurrency bound.
pub struct Batcher {
    config: Arc<CoreConfig>,
    bus: Arc<EventBus>,
    executor: Arc<Executor>,
    processor: Arc<ResponseProcessor>,
    observations: mpsc::Sender<Observation>,
    forming: Mutex<Vec<FormingBatch>>,
    queue: Mutex<BinaryHeap<QueuedJob>>,
    queue_notify: Notify,
    semaphore: Arc<Semaphore>,
    seq: AtomicU64,
    pending: AtomicUsize,
    shedding: AtomicBool,
    cancels: DashMap<RequestId, Arc<AtomicBool>>,
}

impl Batcher {
    pub fn new(
        config: Arc<CoreConfig>,
        bus: Arc<EventBus>,
        executor: Arc<Executor>,
        processor: Arc<ResponseProcessor>,
        observations: mpsc::Sender<Observation>,
    ) -> Arc<Self> {
        let concurrency = config.concurrency_limit.max(1);
        Arc::new(Self {
            config,
            bus,
            executor,
            processor,
            observations,
            forming: Mutex::new(Vec::new()),
            queue: Mutex::new(BinaryHeap::new()),
            queue_notify: Notify::new(),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            seq: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            shedding: AtomicBool::new(false),
            cancels: DashMap::new(),
        })
    }

    /// Spawn the flush and dispatch loops. They stop when `token` fires.
    pub fn run(self: &Arc<Self>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let flush = {
            let batcher = self.clone();
            let token = token.clone();
            tokio::spawn(async move { batcher.run_flush(token).await })
        };
        let dispatch = {
            let batcher = self.clone();
            tokio::spawn(async move { batcher.run_dispatch(token).await })
        };
        vec![flush, dispatch]
    }

    /// Hand a routed request to the batcher; the returned channel resolves
    /// with the terminal outcome.
    pub fn submit(
        &self,
        prep: PreprocessedRequest,
        decision: RoutingDecision,
        stream_tx: Option<mpsc::Sender<StreamChunk>>,
    ) -> oneshot::Receiver<Result<ProcessedResponse>> {
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        self.cancels.insert(prep.id(), cancelled.clone());
        let member = Member {
            prep,
            decision,
            responder: tx,
            stream_tx,
            cancelled,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.update_shedding();
        self.place(member);
        rx
    }

    /// Cancel a pending request. Returns whether a pending request was found.
    pub fn cancel(&self, id: RequestId) -> bool {
        // still forming: remove the member and resolve immediately
        let removed = {
            let mut forming = self.forming.lock();
            let mut found = None;
            for batch in forming.iter_mut() {
                if let Some(pos) = batch.members.iter().position(|m| m.id() == id) {
                    found = Some(batch.members.remove(pos));
                    break;
                }
            }
            forming.retain(|b| !b.members.is_empty());
            found
        };
        if let Some(member) = removed {
            tracing::debug!(request_id = %id, "Cancelled request while forming");
            member.cancelled.store(true, Ordering::Relaxed);
            let _ = member.responder.send(Err(CoreError::Cancelled));
            self.finish_bookkeeping(id);
            return true;
        }

        // queued or running: flag it; the worker discards the result
        if let Some(flag) = self.cancels.get(&id) {
            tracing::debug!(request_id = %id, "Flagged queued/running request as cancelled");
            flag.store(true, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Pending members across forming, queued, and running work.
    pub fn queue_depth(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Whether submissions should currently be refused.
    pub fn is_shedding(&self) -> bool {
        self.shedding.load(Ordering::Relaxed)
    }

    fn place(&self, member: Member) {
        let urgent = member.prep.request.priority == Priority::Urgent;
        let max_batch = self.config.max_batch_size;

        let sealed = {
            let mut forming = self.forming.lock();

            let mut target: Option<(usize, BatchStrategy)> = None;
            for strategy in [
                BatchStrategy::Similarity,
                BatchStrategy::Backend,
                BatchStrategy::Priority,
                BatchStrategy::Temporal,
            ] {
                if let Some(index) = forming.iter().position(|batch| {
                    batch.members.len() < max_batch && compatible(strategy, batch, &member)
                }) {
                    target = Some((index, strategy));
                    break;
                }
            }

            match target {
                Some((index, strategy)) => {
                    let batch = &mut forming[index];
                    // a singleton batch adopts the strategy that first matched
                    if batch.members.len() == 1 {
                        batch.strategy = strategy;
                    }
                    batch.members.push(member);
                    let full = batch.members.len() >= max_batch;
                    if full || urgent {
                        Some(forming.remove(index))
                    } else {
                        None
                    }
                }
                None if urgent => {
                    // emergency bypass: no compatible batch, dispatch alone
                    let batch = FormingBatch {
                        id: BatchId::new(),
                        strategy: BatchStrategy::Emergency,
                        members: vec![member],
                        deadline: Instant::now(),
                    };
                    Some(batch)
                }
                None => {
                    let wait = self.wait_window(member.prep.request.priority);
                    let batch = FormingBatch {
                        id: BatchId::new(),
                        strategy: BatchStrategy::Temporal,
                        members: vec![member],
                        deadline: Instant::now() + wait,
                    };
                    self.bus.publish(
                        EventKind::BatchFormed,
                        None,
                        json!({"batch_id": batch.id, "wait_ms": wait.as_millis() as u64}),
                    );
                    forming.push(batch);
                    None
                }
            }
        };

        if let Some(batch) = sealed {
            self.enqueue(batch);
        }
    }

    /// Wait window scaled by priority and halved while shedding.
    fn wait_window(&self, priority: Priority) -> Duration {
        let base = Duration::from_millis(self.config.max_wait_time_ms);
        let scaled = base.mul_f64(priority.wait_scale());
        if self.is_shedding() {
            scaled / 2
        } else {
            scaled
        }
    }

    fn enqueue(&self, batch: FormingBatch) {
        debug_assert!(!batch.members.is_empty());
        let priority = batch
            .members
            .iter()
            .map(|m| m.prep.effective_priority)
            .max()
            .unwrap_or(1);
        let seq = batch.members.iter().map(|m| m.seq).min().unwrap_or(0);
        self.bus.publish(
            EventKind::BatchScheduled,
            None,
            json!({
                "batch_id": batch.id,
                "strategy": batch.strategy.as_str(),
                "members": batch.members.len(),
                "priority": priority,
            }),
        );
        metrics::counter!("conflux_batches_scheduled_total", "strategy" => batch.strategy.as_str())
            .increment(1);
        metrics::histogram!("conflux_batch_size").record(batch.members.len() as f64);
        tracing::debug!(
            batch_id = %batch.id,
            strategy = batch.strategy.as_str(),
            members = batch.members.len(),
            "Scheduled batch"
        );

        self.queue.lock().push(QueuedJob {
            id: batch.id,
            strategy: batch.strategy,
            members: batch.members,
            priority,
            seq,
        });
        self.queue_notify.notify_one();
    }

    /// Periodically seal or disband forming batches whose window elapsed.
    async fn run_flush(self: Arc<Self>, token: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.batch_flush_interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.flush_expired(),
            }
        }
    }

    fn flush_expired(&self) {
        let now = Instant::now();
        let expired: Vec<FormingBatch> = {
            let mut forming = self.forming.lock();
            let mut out = Vec::new();
            let mut index = 0;
            while index < forming.len() {
                if forming[index].deadline <= now {
                    out.push(forming.remove(index));
                } else {
                    index += 1;
                }
            }
            out
        };

        for batch in expired {
            if batch.members.len() >= self.config.min_batch_size {
                self.enqueue(batch);
            } else {
                // too small to be worth batching: dispatch each alone
                for member in batch.members {
                    self.enqueue(FormingBatch {
                        id: BatchId::new(),
                        strategy: batch.strategy,
                        members: vec![member],
                        deadline: now,
                    });
                }
            }
        }
    }

    /// Drain the queue under the concurrency bound, highest priority first.
    #[tracing::instrument(skip_all)]
    async fn run_dispatch(self: Arc<Self>, token: CancellationToken) {
        tracing::info!("Dispatcher starting");
        let mut join_set: JoinSet<()> = JoinSet::new();
        loop {
            while join_set.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = loop {
                if let Some(job) = self.queue.lock().pop() {
                    break job;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = self.queue_notify.notified() => {}
                }
            };

            let batcher = self.clone();
            join_set.spawn(async move {
                let _permit = permit;
                batcher.run_job(job).await;
            });
        }
        tracing::info!("Dispatcher stopping");
    }

    async fn run_job(self: Arc<Self>, job: QueuedJob) {
        tracing::debug!(
            batch_id = %job.id,
            strategy = job.strategy.as_str(),
            members = job.members.len(),
            "Running batch"
        );
        let total = job.members.len();
        let mut failed = 0usize;

        // members run sequentially, preserving submission order
        for member in job.members {
            if !self.run_member(member).await {
                failed += 1;
            }
        }

        if failed == total {
            self.bus.publish(
                EventKind::BatchFailed,
                None,
                json!({"batch_id": job.id, "members": total}),
            );
        } else {
            self.bus.publish(
                EventKind::BatchCompleted,
                None,
                json!({"batch_id": job.id, "members": total, "failed": failed}),
            );
        }
    }

    /// Execute one member end to end. Returns whether it succeeded.
    async fn run_member(&self, member: Member) -> bool {
        let id = member.id();
        let started = Instant::now();

        let outcome: Result<ProcessedResponse> = if member
            .cancelled
            .load(Ordering::Relaxed)
        {
            Err(CoreError::Cancelled)
        } else if member.prep.request.is_expired(Utc::now()) {
            // stage boundary: no backend call past the deadline
            Err(CoreError::TimeoutExceeded)
        } else {
            match self
                .executor
                .execute(
                    &member.prep,
                    &member.decision,
                    &member.cancelled,
                    member.stream_tx.as_ref(),
                )
                .await
            {
                _ if member.cancelled.load(Ordering::Relaxed) => {
                    // result discarded; the caller already moved on
                    Err(CoreError::Cancelled)
                }
                Ok(exec) => {
                    let meta = ResponseMeta {
                        agent_id: exec.agent_id.clone(),
                        attempts: exec.attempts,
                        degraded: exec.degraded,
                        streaming: member.stream_tx.is_some(),
                        elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
                    };
                    let response = self.processor.process(exec.raw, &member.prep, &meta);
                    if let Some(agent_id) = &meta.agent_id {
                        let _ = self.observations.try_send(Observation::Quality(
                            agent_id.clone(),
                            response.quality_score,
                        ));
                    }
                    if let Some(tx) = &member.stream_tx {
                        if !exec.streamed {
                            let _ = tx.send(StreamChunk::content(response.content.clone())).await;
                        }
                        let _ = tx.send(StreamChunk::done()).await;
                    }
                    Ok(response)
                }
                Err(error) => {
                    if let Some(tx) = &member.stream_tx {
                        let _ = tx.send(StreamChunk::error(error.to_string())).await;
                        let _ = tx.send(StreamChunk::done()).await;
                    }
                    Err(error)
                }
            }
        };

        let succeeded = outcome.is_ok();
        let _ = member.responder.send(outcome);
        self.finish_bookkeeping(id);
        succeeded
    }

    fn finish_bookkeeping(&self, id: RequestId) {
        self.cancels.remove(&id);
        self.pending.fetch_sub(1, Ordering::Relaxed);
        self.update_shedding();
        metrics::gauge!("conflux_pending_requests").set(self.pending.load(Ordering::Relaxed) as f64);
    }

    fn update_shedding(&self) {
        let depth = self.pending.load(Ordering::Relaxed);
        if depth >= self.config.high_water {
            if !self.shedding.swap(true, Ordering::Relaxed) {
                tracing::warn!(depth, "Entering overload shedding");
            }
        } else if depth <= self.config.low_water && self.shedding.swap(false, Ordering::Relaxed) {
            tracing::info!(depth, "Leaving overload shedding");
        }
    }
}

fn compatible(strategy: BatchStrategy, batch: &FormingBatch, member: &Member) -> bool {
    match strategy {
        BatchStrategy::Emergency => false,
        BatchStrategy::Similarity => batch.members.iter().all(|m| {
            parameter_jaccard(&m.prep.request, &member.prep.request) > SIMILARITY_FLOOR
        }),
        BatchStrategy::Backend => batch
            .members
            .first()
            .map(|m| m.decision.agent_id == member.decision.agent_id)
            .unwrap_or(false),
        BatchStrategy::Priority => batch
            .members
            .first()
            .map(|m| m.prep.request.priority == member.prep.request.priority)
            .unwrap_or(false),
        BatchStrategy::Temporal => batch.members.iter().all(|m| {
            let delta = member.prep.request.submitted_at - m.prep.request.submitted_at;
            delta.num_milliseconds().abs() <= TEMPORAL_WINDOW_MS
        }),
    }
}

/// Jaccard similarity over parameter key sets; two empty sets are identical.
fn parameter_jaccard(a: &crate::types::Request, b: &crate::types::Request) -> f64 {
    if a.parameters.is_empty() && b.parameters.is_empty() {
        return 1.0;
    }
    let keys_a: std::collections::BTreeSet<&String> = a.parameters.keys().collect();
    let keys_b: std::collections::BTreeSet<&String> = b.parameters.keys().collect();
    let intersection = keys_a.intersection(&keys_b).count();
    let union = keys_a.union(&keys_b).count();
    if union == 0 {
        1.0
    } else {
        intersection as f64 / union as f64
    }
}
