//! Single-flight evaluation coalescer
//!
//! At most one evaluation is in flight. Requests that arrive meanwhile are
//! queued and drained strictly in arrival order by whichever task holds the
//! gate. When the queue runs dry, the fetch phase runs for the last request
//! with the gate already released.
//!
//! # Example
//!
//! ```rust,ignore
//! use formeval_core::prelude::*;
//!
//! let coalescer = FormEvaluationCoalescer::new(evaluator, fetcher);
//! match coalescer.submit(FormEvalRequest::new("form-1")).await {
//!     Submission::Queued { position } => println!("queued at {position}"),
//!     Submission::Drained(report) => println!("processed {}", report.processed.len()),
//! }
//! ```

use crate::config::FormEvalConfig;
use crate::dynamic_values::{fetch_dynamic_values, FetchReport};
use crate::evaluator::FormEvaluator;
use crate::fetcher::DynamicValueFetcher;
use crate::store::EvaluationStore;
use crate::types::{EvaluationState, FormEvalOutput, FormEvalRequest, FormId, UpdateOrigin};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Coalescer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalescerStats {
    /// Requests handed to `admit`/`submit`
    pub submitted: u64,
    /// Requests that had to wait in the queue
    pub queued: u64,
    /// Evaluations that completed without error
    pub evaluated: u64,
    /// Evaluations that failed
    pub failed: u64,
    /// Completed evaluations with nothing to merge
    pub empty_results: u64,
    /// Dynamic value fetches issued
    pub fetches_started: u64,
    /// Fetches whose data was stored
    pub fetches_succeeded: u64,
    /// Fetches that errored
    pub fetches_failed: u64,
    /// Fetches with an empty response
    pub fetches_empty: u64,
    /// Updates merged into the store
    pub updates_published: u64,
}

/// Lock-free counters behind [`CoalescerStats`]
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    submitted: AtomicU64,
    queued: AtomicU64,
    evaluated: AtomicU64,
    failed: AtomicU64,
    empty_results: AtomicU64,
    fetches_started: AtomicU64,
    fetches_succeeded: AtomicU64,
    fetches_failed: AtomicU64,
    fetches_empty: AtomicU64,
    updates_published: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch_started(&self) {
        Self::bump(&self.fetches_started);
    }

    pub(crate) fn record_fetch_succeeded(&self) {
        Self::bump(&self.fetches_succeeded);
    }

    pub(crate) fn record_fetch_failed(&self) {
        Self::bump(&self.fetches_failed);
    }

    pub(crate) fn record_fetch_empty(&self) {
        Self::bump(&self.fetches_empty);
    }

    pub(crate) fn snapshot(&self) -> CoalescerStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CoalescerStats {
            submitted: load(&self.submitted),
            queued: load(&self.queued),
            evaluated: load(&self.evaluated),
            failed: load(&self.failed),
            empty_results: load(&self.empty_results),
            fetches_started: load(&self.fetches_started),
            fetches_succeeded: load(&self.fetches_succeeded),
            fetches_failed: load(&self.fetches_failed),
            fetches_empty: load(&self.fetches_empty),
            updates_published: load(&self.updates_published),
        }
    }
}

/// Result of [`FormEvaluationCoalescer::submit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Another evaluation was in flight; the request waits at `position`
    /// (1-based) in the queue
    Queued {
        /// Queue position after enqueueing
        position: usize,
    },
    /// This call held the gate and drained the queue
    Drained(DrainReport),
}

/// Work done by one leader between taking and releasing the gate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Forms evaluated, in processing order (failed ones included)
    pub processed: Vec<FormId>,
    /// How many of them failed
    pub failed: usize,
    /// Fetch phase for the last request, if it ran
    pub fetch: Option<FetchReport>,
}

/// Outcome of [`FormEvaluationCoalescer::admit`]
#[derive(Debug)]
pub enum Admission {
    /// The caller now holds the gate and must drive the lease
    Leader(Lease),
    /// The request was queued behind the in-flight evaluation
    Queued {
        /// Queue position after enqueueing
        position: usize,
    },
}

#[derive(Debug, Default)]
struct Gate {
    in_flight: bool,
    queue: VecDeque<FormEvalRequest>,
}

struct Inner {
    evaluator: Arc<dyn FormEvaluator>,
    fetcher: Arc<dyn DynamicValueFetcher>,
    store: Arc<EvaluationStore>,
    gate: Mutex<Gate>,
    fetching: AtomicUsize,
    idle: Notify,
    stats: StatsCounters,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("gate", &*self.gate.lock())
            .field("fetching", &self.fetching.load(Ordering::Acquire))
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

/// Serializes evaluations against one shared [`EvaluationStore`]
///
/// Cheap to clone; clones share the gate, queue and store.
#[derive(Debug, Clone)]
pub struct FormEvaluationCoalescer {
    inner: Arc<Inner>,
}

impl FormEvaluationCoalescer {
    /// Create coalescer with a default store
    #[must_use]
    pub fn new(
        evaluator: impl FormEvaluator + 'static,
        fetcher: impl DynamicValueFetcher + 'static,
    ) -> Self {
        Self::with_store(
            Arc::new(evaluator),
            Arc::new(fetcher),
            Arc::new(EvaluationStore::default()),
        )
    }

    /// Create coalescer sized from configuration
    #[must_use]
    pub fn from_config(
        config: &FormEvalConfig,
        evaluator: Arc<dyn FormEvaluator>,
        fetcher: Arc<dyn DynamicValueFetcher>,
    ) -> Self {
        Self::with_store(
            evaluator,
            fetcher,
            Arc::new(EvaluationStore::new(config.update_channel_capacity)),
        )
    }

    /// Create coalescer over an existing store
    #[must_use]
    pub fn with_store(
        evaluator: Arc<dyn FormEvaluator>,
        fetcher: Arc<dyn DynamicValueFetcher>,
        store: Arc<EvaluationStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                evaluator,
                fetcher,
                store,
                gate: Mutex::new(Gate::default()),
                fetching: AtomicUsize::new(0),
                idle: Notify::new(),
                stats: StatsCounters::default(),
            }),
        }
    }

    /// Accept a request without suspending
    ///
    /// If an evaluation is in flight the request is queued. Otherwise the
    /// caller becomes leader and gets a [`Lease`] to drive. Requests left
    /// queued by a leader that was cancelled run before the new one.
    #[must_use]
    pub fn admit(&self, request: FormEvalRequest) -> Admission {
        StatsCounters::bump(&self.inner.stats.submitted);
        let mut gate = self.inner.gate.lock();

        if gate.in_flight {
            tracing::debug!(form_id = %request.form_id, "evaluation in flight, queueing request");
            gate.queue.push_back(request);
            StatsCounters::bump(&self.inner.stats.queued);
            return Admission::Queued {
                position: gate.queue.len(),
            };
        }

        gate.in_flight = true;
        let request = match gate.queue.pop_front() {
            Some(stranded) => {
                tracing::debug!(
                    form_id = %request.form_id,
                    stranded = %stranded.form_id,
                    "running stranded request first"
                );
                gate.queue.push_back(request);
                StatsCounters::bump(&self.inner.stats.queued);
                stranded
            }
            None => request,
        };

        Admission::Leader(Lease {
            request,
            guard: GateGuard {
                inner: Arc::clone(&self.inner),
                held: true,
            },
        })
    }

    /// Evaluate `request` now, or queue it if an evaluation is in flight
    ///
    /// A queued call returns immediately. A leading call returns once the
    /// queue is drained and the fetch phase for the last request is done.
    pub async fn submit(&self, request: FormEvalRequest) -> Submission {
        match self.admit(request) {
            Admission::Leader(lease) => Submission::Drained(lease.drive().await),
            Admission::Queued { position } => Submission::Queued { position },
        }
    }

    /// Whether an evaluation is in flight
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.inner.gate.lock().in_flight
    }

    /// Whether any fetch phase is running
    #[must_use]
    pub fn is_fetching(&self) -> bool {
        self.inner.fetching.load(Ordering::Acquire) > 0
    }

    /// Requests waiting behind the in-flight evaluation
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.gate.lock().queue.len()
    }

    /// Form IDs waiting in the queue, front first
    #[must_use]
    pub fn queued_forms(&self) -> Vec<FormId> {
        self.inner
            .gate
            .lock()
            .queue
            .iter()
            .map(|r| r.form_id.clone())
            .collect()
    }

    /// Nothing evaluating, nothing fetching, nothing queued
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let gate = self.inner.gate.lock();
        !gate.in_flight && gate.queue.is_empty() && !self.is_fetching()
    }

    /// Wait until [`is_idle`](Self::is_idle) holds
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Shared state store
    #[must_use]
    pub fn store(&self) -> &Arc<EvaluationStore> {
        &self.inner.store
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> CoalescerStats {
        self.inner.stats.snapshot()
    }
}

/// Exclusive right to evaluate, handed out by [`FormEvaluationCoalescer::admit`]
///
/// Dropping a lease without driving it releases the gate.
#[derive(Debug)]
pub struct Lease {
    request: FormEvalRequest,
    guard: GateGuard,
}

impl Lease {
    /// Request this lease evaluates first
    #[must_use]
    pub fn request(&self) -> &FormEvalRequest {
        &self.request
    }

    /// Evaluate the request, drain the queue, then run the fetch phase for
    /// the last request processed
    pub async fn drive(self) -> DrainReport {
        let Lease {
            mut request,
            mut guard,
        } = self;
        let inner = Arc::clone(&guard.inner);
        let mut report = DrainReport::default();

        loop {
            let outcome = inner.evaluate(&request).await;
            report.processed.push(request.form_id.clone());
            if outcome.is_none() {
                report.failed += 1;
            }

            let output = outcome.and_then(|mut result| result.take(&request.form_id));
            match guard.hand_over(output.is_some()) {
                Some(next) => {
                    tracing::debug!(form_id = %next.form_id, "starting next queued evaluation");
                    request = next;
                }
                None => {
                    match output {
                        Some(output) => {
                            let _fetching = FetchingGuard::adopt(&inner);
                            report.fetch = Some(inner.fetch_phase(&request.form_id, output).await);
                        }
                        None => {
                            tracing::debug!(form_id = %request.form_id, "no output for form, skipping dynamic values");
                        }
                    }
                    return report;
                }
            }
        }
    }
}

impl Inner {
    /// Run the evaluator and merge a non-empty result
    ///
    /// `None` means the evaluation failed; an empty result is `Some` of an
    /// empty state.
    async fn evaluate(&self, request: &FormEvalRequest) -> Option<EvaluationState> {
        let current = self.store.snapshot();
        tracing::debug!(form_id = %request.form_id, kind = ?request.kind, "evaluating form");

        match self.evaluator.evaluate(&current, request).await {
            Ok(Some(result)) if !result.is_empty() => {
                StatsCounters::bump(&self.stats.evaluated);
                if self.store.merge(result.clone(), UpdateOrigin::Evaluation) {
                    StatsCounters::bump(&self.stats.updates_published);
                }
                Some(result)
            }
            Ok(_) => {
                StatsCounters::bump(&self.stats.evaluated);
                StatsCounters::bump(&self.stats.empty_results);
                tracing::debug!(form_id = %request.form_id, "evaluation produced no output");
                Some(EvaluationState::new())
            }
            Err(e) => {
                StatsCounters::bump(&self.stats.failed);
                tracing::error!(form_id = %request.form_id, error = %e, "form evaluation failed");
                None
            }
        }
    }

    async fn fetch_phase(&self, form_id: &FormId, output: FormEvalOutput) -> FetchReport {
        let (output, report) =
            fetch_dynamic_values(self.fetcher.as_ref(), form_id, output, &self.stats).await;

        if self
            .store
            .merge(EvaluationState::single(form_id.clone(), output), UpdateOrigin::DynamicValues)
        {
            StatsCounters::bump(&self.stats.updates_published);
        }

        if !report.attempted.is_empty() {
            tracing::info!(
                form_id = %form_id,
                attempted = report.attempted.len(),
                succeeded = report.succeeded,
                failed = report.failed,
                "dynamic values fetched"
            );
        }
        report
    }
}

/// Releases the gate on drop unless it was handed over or released already
#[derive(Debug)]
struct GateGuard {
    inner: Arc<Inner>,
    held: bool,
}

impl GateGuard {
    /// Take the next queued request while keeping the gate, or release the
    /// gate if the queue is empty
    ///
    /// With `fetch_pending` the fetch phase is counted before the gate opens,
    /// so the coalescer never looks idle in between.
    fn hand_over(&mut self, fetch_pending: bool) -> Option<FormEvalRequest> {
        let mut gate = self.inner.gate.lock();
        if let Some(next) = gate.queue.pop_front() {
            return Some(next);
        }
        if fetch_pending {
            self.inner.fetching.fetch_add(1, Ordering::AcqRel);
        }
        gate.in_flight = false;
        self.held = false;
        drop(gate);
        self.inner.idle.notify_waiters();
        None
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if self.held {
            let remaining = {
                let mut gate = self.inner.gate.lock();
                gate.in_flight = false;
                gate.queue.len()
            };
            tracing::warn!(queued = remaining, "evaluation abandoned, gate released");
            self.inner.idle.notify_waiters();
        }
    }
}

struct FetchingGuard<'a> {
    inner: &'a Inner,
}

impl<'a> FetchingGuard<'a> {
    /// Take over a fetch count added by `GateGuard::hand_over`
    fn adopt(inner: &'a Inner) -> Self {
        Self { inner }
    }
}

impl Drop for FetchingGuard<'_> {
    fn drop(&mut self) {
        self.inner.fetching.fetch_sub(1, Ordering::AcqRel);
        self.inner.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvalError;
    use crate::evaluator::BlockingEvaluator;
    use crate::fetcher::NoopFetcher;
    use crate::types::{ConditionalOutput, FormEvalOutput};

    fn echo_evaluator() -> BlockingEvaluator<
        impl Fn(&EvaluationState, &FormEvalRequest) -> Result<Option<EvaluationState>, EvalError>
            + Send
            + Sync
            + 'static,
    > {
        BlockingEvaluator::new(|_: &EvaluationState, request: &FormEvalRequest| {
            Ok(Some(EvaluationState::single(
                request.form_id.clone(),
                FormEvalOutput::new().with_field("field", ConditionalOutput::visible()),
            )))
        })
    }

    #[tokio::test]
    async fn idle_before_and_after_submit() {
        let coalescer = FormEvaluationCoalescer::new(echo_evaluator(), NoopFetcher);
        assert!(!coalescer.is_in_flight());
        assert!(coalescer.is_idle());

        let submission = coalescer.submit(FormEvalRequest::new("form-1")).await;

        let Submission::Drained(report) = submission else {
            panic!("expected leader to drain");
        };
        assert_eq!(report.processed, vec![FormId::new("form-1")]);
        assert_eq!(report.failed, 0);
        assert!(report.fetch.is_some());
        assert!(!coalescer.is_in_flight());
        assert!(coalescer.is_idle());
        assert!(coalescer.store().get(&"form-1".into()).is_some());
    }

    #[tokio::test]
    async fn admit_while_leased_queues() {
        let coalescer = FormEvaluationCoalescer::new(echo_evaluator(), NoopFetcher);

        let Admission::Leader(lease) = coalescer.admit(FormEvalRequest::new("a")) else {
            panic!("first admission should lead");
        };
        assert!(coalescer.is_in_flight());
        assert!(matches!(
            coalescer.admit(FormEvalRequest::new("b")),
            Admission::Queued { position: 1 }
        ));
        assert!(matches!(
            coalescer.admit(FormEvalRequest::new("c")),
            Admission::Queued { position: 2 }
        ));
        assert_eq!(coalescer.queued_forms(), vec![FormId::new("b"), FormId::new("c")]);

        let report = lease.drive().await;
        assert_eq!(
            report.processed,
            vec![FormId::new("a"), FormId::new("b"), FormId::new("c")]
        );
        assert_eq!(report.fetch.unwrap().form_id, Some(FormId::new("c")));
        assert!(coalescer.is_idle());
    }

    #[tokio::test]
    async fn dropped_lease_releases_gate_and_keeps_queue() {
        let coalescer = FormEvaluationCoalescer::new(echo_evaluator(), NoopFetcher);

        let Admission::Leader(lease) = coalescer.admit(FormEvalRequest::new("a")) else {
            panic!("first admission should lead");
        };
        let _ = coalescer.admit(FormEvalRequest::new("b"));
        drop(lease);

        assert!(!coalescer.is_in_flight());
        assert_eq!(coalescer.queue_len(), 1);

        // The stranded request runs ahead of the new trigger.
        let Submission::Drained(report) = coalescer.submit(FormEvalRequest::new("c")).await else {
            panic!("expected leader to drain");
        };
        assert_eq!(report.processed, vec![FormId::new("b"), FormId::new("c")]);
        assert_eq!(coalescer.stats().submitted, 3);
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_idle() {
        let coalescer = FormEvaluationCoalescer::new(echo_evaluator(), NoopFetcher);
        tokio::time::timeout(std::time::Duration::from_secs(1), coalescer.wait_idle())
            .await
            .expect("idle coalescer should not block");
    }
}
