//! The dispatcher control loop.
//!
//! One cycle enumerates the queue, requeues orphans, starts eligible keys
//! within the concurrency budget, and waits for every launched worker to
//! transition its key. Workers are spawned as independent tasks, so the
//! transitions at the tail of an attempt keep running even if the future
//! driving the cycle is dropped mid-shutdown; each transition is
//! additionally bounded by the cleanup timeout.
//!
//! Several dispatcher replicas may run against one backend: correctness
//! rests entirely on the atomicity of `start`, and losing a start race is
//! an expected, quiet event.

use std::{future::Future, sync::Arc, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::Utc;
use futures::future::join_all;
use shepherd_core::{Action, ProcessRequest, ProcessResponse, QueueOptions, ReconcileError};
use shepherd_queue::{Backend, InProgressKey, OwnedKey, QueueError, WorkQueue};
use thiserror::Error;
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::processor::Processor;

/// Dispatcher failures. Anything that happens after enumeration is handled
/// per-key (logged and retried through queue state), not surfaced here.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The queue could not be enumerated.
    #[error("queue enumeration failed")]
    Enumerate(#[source] QueueError),
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Workers launched this cycle.
    pub launched: usize,
    /// Healthy in-progress keys observed (other replicas' or our own).
    pub active: usize,
    /// Orphaned keys handed back to the queued set.
    pub orphans_requeued: usize,
}

/// Wakes the dispatcher outside its periodic tick.
#[derive(Clone)]
pub struct PulseHandle {
    notify: Arc<Notify>,
}

impl PulseHandle {
    /// Request an immediate dispatch cycle.
    pub fn pulse(&self) {
        self.notify.notify_one();
    }
}

/// Drives queued work through a [`Processor`] under concurrency budgets.
pub struct Dispatcher<B, P> {
    queue: WorkQueue<B>,
    processor: Arc<P>,
    concurrency: usize,
    per_cycle: usize,
    max_retry: u32,
    tick: Duration,
    cleanup_timeout: Duration,
    pulse: Arc<Notify>,
}

impl<B: Backend, P: Processor> Dispatcher<B, P> {
    /// A dispatcher over `queue` invoking `processor`.
    pub fn new(queue: WorkQueue<B>, processor: P) -> Self {
        Self {
            queue,
            processor: Arc::new(processor),
            concurrency: 16,
            per_cycle: 0,
            max_retry: 3,
            tick: Duration::from_secs(10),
            cleanup_timeout: Duration::from_secs(30),
            pulse: Arc::new(Notify::new()),
        }
    }

    /// Cap on concurrently running workers across cycles.
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Cap on launches within a single cycle; `0` means unbounded (up to
    /// the concurrency budget).
    #[must_use]
    pub fn per_cycle(mut self, per_cycle: usize) -> Self {
        self.per_cycle = per_cycle;
        self
    }

    /// Failed attempts after which a key is dead-lettered.
    #[must_use]
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Interval between periodic cycles in [`run`](Self::run).
    #[must_use]
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Bound on each queue transition at the tail of an attempt.
    #[must_use]
    pub fn cleanup_timeout(mut self, cleanup_timeout: Duration) -> Self {
        self.cleanup_timeout = cleanup_timeout;
        self
    }

    /// A handle that triggers cycles on demand.
    pub fn pulse_handle(&self) -> PulseHandle {
        PulseHandle {
            notify: Arc::clone(&self.pulse),
        }
    }

    /// Run one dispatch cycle. Returns once every worker launched by this
    /// cycle has transitioned its key.
    pub async fn cycle(&self) -> Result<CycleOutcome, DispatchError> {
        let snapshot = self.queue.enumerate().await.map_err(DispatchError::Enumerate)?;

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut active = 0usize;
        let mut orphans_requeued = 0usize;
        for in_progress in snapshot.in_progress {
            if in_progress.is_orphaned() {
                orphans_requeued += 1;
                let cleanup_timeout = self.cleanup_timeout;
                handles.push(tokio::spawn(requeue_orphan(in_progress, cleanup_timeout)));
            } else {
                active += 1;
            }
        }

        let mut slots = self.concurrency.saturating_sub(active);
        if self.per_cycle > 0 {
            slots = slots.min(self.per_cycle);
        }

        let mut launched = 0usize;
        for queued in snapshot.queued {
            if launched >= slots {
                break;
            }
            if !queued.is_eligible() {
                continue;
            }
            match queued.start().await {
                Ok(owned) => {
                    launched += 1;
                    let worker = Worker {
                        queue: self.queue.clone(),
                        processor: Arc::clone(&self.processor),
                        max_retry: self.max_retry,
                        cleanup_timeout: self.cleanup_timeout,
                    };
                    handles.push(tokio::spawn(worker.run(owned)));
                }
                Err(QueueError::Conflict(key)) => debug!(%key, "lost start race"),
                Err(err) => warn!(key = queued.name(), error = %err, "failed to start key"),
            }
        }

        for join in join_all(handles).await {
            if let Err(err) = join {
                error!(error = %err, "dispatcher task panicked");
            }
        }
        Ok(CycleOutcome {
            launched,
            active,
            orphans_requeued,
        })
    }

    /// Cycle on a periodic tick and on demand pulses until `shutdown`
    /// resolves. Enumeration failures back off exponentially; in-flight
    /// workers always finish their attempt before the loop observes
    /// shutdown.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut tick = interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry = ExponentialBackoff {
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("dispatcher shutting down");
                    break;
                }
                _ = tick.tick() => {}
                _ = self.pulse.notified() => debug!("demand pulse"),
            }
            match self.cycle().await {
                Ok(outcome) => {
                    retry.reset();
                    debug!(
                        launched = outcome.launched,
                        active = outcome.active,
                        orphans = outcome.orphans_requeued,
                        "cycle finished"
                    );
                }
                Err(err) => {
                    warn!(error = %err, "cycle failed");
                    if let Some(delay) = retry.next_backoff() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

async fn requeue_orphan<B: Backend>(key: InProgressKey<B>, cleanup_timeout: Duration) {
    match timeout(cleanup_timeout, key.requeue()).await {
        Ok(Ok(())) => info!(key = key.name(), "requeued orphaned key"),
        Ok(Err(QueueError::Conflict(_))) => debug!(key = key.name(), "orphan already recovered"),
        Ok(Err(err)) => error!(key = key.name(), error = %err, "orphan requeue failed"),
        Err(_) => error!(key = key.name(), "orphan requeue timed out"),
    }
}

struct Worker<B, P> {
    queue: WorkQueue<B>,
    processor: Arc<P>,
    max_retry: u32,
    cleanup_timeout: Duration,
}

impl<B: Backend, P: Processor> Worker<B, P> {
    async fn run(self, owned: OwnedKey<B>) {
        let request = ProcessRequest {
            key: owned.name().to_string(),
            priority: owned.priority(),
            attempts: owned.attempts(),
        };
        let key = request.key.clone();
        let heartbeat_every =
            (self.queue.config().lease_duration / 2).max(Duration::from_millis(100));

        let outcome = {
            let process = self.processor.process(request);
            tokio::pin!(process);
            let mut heartbeat = interval(heartbeat_every);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; consume it so the
            // in-loop ticks land one period apart.
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    result = &mut process => break result,
                    _ = heartbeat.tick() => {
                        if let Err(err) = owned.extend_lease().await {
                            warn!(%key, error = %err, "failed to extend lease");
                        }
                    }
                }
            }
        };
        self.finish(&key, owned, outcome).await;
    }

    async fn finish(
        &self,
        key: &str,
        owned: OwnedKey<B>,
        outcome: Result<ProcessResponse, ReconcileError>,
    ) {
        match outcome {
            Ok(response) => match Action::from_response(response) {
                Action::Done => self.transition(key, "complete", owned.complete()).await,
                Action::RequeueAfter(delay) => {
                    let opts = QueueOptions::default().not_before(Utc::now() + delay);
                    self.transition(key, "requeue-after", owned.requeue_with_options(opts))
                        .await;
                }
                Action::Fanout(children) => {
                    let mut aborted = false;
                    for child in children {
                        if let Err(err) = self.queue.queue(&child.key, child.options()).await {
                            error!(
                                parent = %key,
                                child = %child.key,
                                error = %err,
                                "child enqueue failed, aborting fanout"
                            );
                            aborted = true;
                            break;
                        }
                    }
                    if aborted {
                        self.transition(key, "requeue", owned.requeue()).await;
                    } else {
                        self.transition(key, "complete", owned.complete()).await;
                    }
                }
            },
            Err(err) if err.is_non_retriable() => {
                warn!(%key, error = %err, "completing without retry");
                self.transition(key, "complete", owned.complete()).await;
            }
            Err(err) => {
                if owned.attempts() >= self.max_retry {
                    warn!(
                        %key,
                        attempts = owned.attempts(),
                        error = %err,
                        "retries exhausted, dead-lettering"
                    );
                    let last_error = err.to_string();
                    self.transition(key, "deadletter", owned.deadletter(&last_error))
                        .await;
                } else {
                    debug!(%key, error = %err, "attempt failed, requeueing");
                    self.transition(key, "requeue", owned.requeue()).await;
                }
            }
        }
    }

    async fn transition(
        &self,
        key: &str,
        what: &'static str,
        transition: impl Future<Output = Result<(), QueueError>>,
    ) {
        match timeout(self.cleanup_timeout, transition).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(%key, transition = what, error = %err, "queue transition failed"),
            Err(_) => error!(%key, transition = what, "queue transition timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Dispatcher;
    use crate::processor::Processor;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use parking_lot::Mutex;
    use shepherd_core::{
        ProcessRequest, ProcessResponse, QueueKeyRequest, QueueOptions, ReconcileError,
    };
    use shepherd_queue::{
        Backend, BackendError, KeyPhase, KeyState, MemoryBackend, Mutation, QueueConfig, WorkQueue,
    };
    use std::{sync::Arc, time::Duration};
    use tokio::sync::Notify;

    type Verdict = Result<ProcessResponse, ReconcileError>;

    /// Records invocations and answers each with `behavior`.
    struct TestProcessor {
        calls: Mutex<Vec<String>>,
        behavior: Box<dyn Fn(&ProcessRequest) -> Verdict + Send + Sync>,
    }

    impl TestProcessor {
        fn new(behavior: impl Fn(&ProcessRequest) -> Verdict + Send + Sync + 'static) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                behavior: Box::new(behavior),
            }
        }

        fn succeeding() -> Self {
            Self::new(|_| Ok(ProcessResponse::default()))
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Processor for TestProcessor {
        async fn process(&self, request: ProcessRequest) -> Verdict {
            self.calls.lock().push(request.key.clone());
            (self.behavior)(&request)
        }
    }

    /// Fails every update whose key starts with `reject_prefix`.
    struct RejectingBackend {
        inner: MemoryBackend,
        reject_prefix: String,
    }

    #[async_trait]
    impl Backend for RejectingBackend {
        async fn update(
            &self,
            key: &str,
            mutation: Mutation<'_>,
        ) -> Result<Option<KeyState>, BackendError> {
            if key.starts_with(&self.reject_prefix) {
                return Err(BackendError::Unavailable("injected outage".into()));
            }
            self.inner.update(key, mutation).await
        }

        async fn list(&self) -> Result<Vec<KeyState>, BackendError> {
            self.inner.list().await
        }
    }

    fn test_config() -> QueueConfig {
        QueueConfig {
            backoff_base: Duration::ZERO,
            backoff_cap: 6,
            lease_duration: Duration::from_secs(30),
            owner_id: "worker-test".into(),
        }
    }

    fn test_queue() -> WorkQueue<MemoryBackend> {
        WorkQueue::with_config(MemoryBackend::new(), test_config())
    }

    async fn states(queue: &WorkQueue<impl Backend>) -> (Vec<String>, Vec<String>, Vec<String>) {
        let snapshot = queue.enumerate().await.unwrap();
        (
            snapshot.queued.iter().map(|k| k.name().to_string()).collect(),
            snapshot.in_progress.iter().map(|k| k.name().to_string()).collect(),
            snapshot.deadlettered.iter().map(|k| k.name().to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn single_success_empties_the_queue() {
        let queue = test_queue();
        queue.queue("k1", QueueOptions::default()).await.unwrap();

        let processor = Arc::new(TestProcessor::succeeding());
        let dispatcher = Dispatcher::new(queue.clone(), Arc::clone(&processor)).concurrency(1);
        let outcome = dispatcher.cycle().await.unwrap();

        assert_eq!(outcome.launched, 1);
        assert_eq!(processor.calls(), vec!["k1"]);
        assert_eq!(states(&queue).await, (vec![], vec![], vec![]));
    }

    #[tokio::test]
    async fn higher_priority_starts_first() {
        let queue = test_queue();
        queue.queue("a", QueueOptions::default().with_priority(1)).await.unwrap();
        queue.queue("b", QueueOptions::default().with_priority(10)).await.unwrap();

        let processor = Arc::new(TestProcessor::succeeding());
        let dispatcher = Dispatcher::new(queue.clone(), Arc::clone(&processor)).concurrency(1);

        dispatcher.cycle().await.unwrap();
        assert_eq!(processor.calls(), vec!["b"]);
        dispatcher.cycle().await.unwrap();
        assert_eq!(processor.calls(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn failing_key_is_dead_lettered_after_max_retry() {
        let queue = test_queue();
        queue.queue("k", QueueOptions::default()).await.unwrap();

        let processor = Arc::new(TestProcessor::new(|_| {
            Err(ReconcileError::failed(std::io::Error::other("boom")))
        }));
        let dispatcher = Dispatcher::new(queue.clone(), Arc::clone(&processor)).max_retry(3);

        for _ in 0..4 {
            dispatcher.cycle().await.unwrap();
        }

        assert_eq!(processor.calls().len(), 4);
        let snapshot = queue.enumerate().await.unwrap();
        assert_eq!(snapshot.deadlettered.len(), 1);
        assert_eq!(snapshot.deadlettered[0].attempts(), 4);
        assert!(snapshot.deadlettered[0].last_error().contains("boom"));
        assert!(snapshot.queued.is_empty());

        // A further cycle finds nothing to do.
        let outcome = dispatcher.cycle().await.unwrap();
        assert_eq!(outcome.launched, 0);
        assert_eq!(processor.calls().len(), 4);
    }

    #[tokio::test]
    async fn requeue_after_delays_without_counting_an_attempt() {
        let queue = test_queue();
        queue.queue("k", QueueOptions::default()).await.unwrap();

        let processor = Arc::new(TestProcessor::new(|_| {
            Ok(ProcessResponse {
                requeue_after_seconds: Some(60),
                ..ProcessResponse::default()
            })
        }));
        let dispatcher = Dispatcher::new(queue.clone(), Arc::clone(&processor));
        let before = Utc::now();
        dispatcher.cycle().await.unwrap();

        let snapshot = queue.enumerate().await.unwrap();
        assert_eq!(snapshot.queued.len(), 1);
        assert_eq!(snapshot.queued[0].attempts(), 0);
        assert!(snapshot.queued[0].not_before() >= before + ChronoDuration::seconds(60));
        assert!(!snapshot.queued[0].is_eligible());

        // Not yet eligible, so the next cycle leaves it alone.
        dispatcher.cycle().await.unwrap();
        assert_eq!(processor.calls(), vec!["k"]);
    }

    #[tokio::test]
    async fn fanout_completes_parent_and_queues_children() {
        let queue = test_queue();
        queue.queue("parent", QueueOptions::default()).await.unwrap();

        let processor = Arc::new(TestProcessor::new(|req| {
            if req.key == "parent" {
                Ok(ProcessResponse {
                    queue_keys: vec![
                        QueueKeyRequest::new("child1").priority(5),
                        QueueKeyRequest::new("child2").delay_seconds(30),
                    ],
                    ..ProcessResponse::default()
                })
            } else {
                Ok(ProcessResponse::default())
            }
        }));
        let dispatcher = Dispatcher::new(queue.clone(), Arc::clone(&processor));
        let before = Utc::now();
        dispatcher.cycle().await.unwrap();

        let snapshot = queue.enumerate().await.unwrap();
        let names: Vec<&str> = snapshot.queued.iter().map(|k| k.name()).collect();
        assert_eq!(names, vec!["child1", "child2"]);
        assert_eq!(snapshot.queued[0].priority(), 5);
        assert!(snapshot.queued[0].is_eligible());
        assert!(snapshot.queued[1].not_before() >= before + ChronoDuration::seconds(30));
    }

    #[tokio::test]
    async fn fanout_aborts_and_requeues_parent_when_a_child_enqueue_fails() {
        let backend = RejectingBackend {
            inner: MemoryBackend::new(),
            reject_prefix: "child2".into(),
        };
        let queue = WorkQueue::with_config(backend, test_config());
        queue.queue("parent", QueueOptions::default()).await.unwrap();

        let processor = Arc::new(TestProcessor::new(|req| {
            if req.key == "parent" {
                Ok(ProcessResponse {
                    queue_keys: vec![
                        QueueKeyRequest::new("child1"),
                        QueueKeyRequest::new("child2"),
                        QueueKeyRequest::new("child3"),
                    ],
                    ..ProcessResponse::default()
                })
            } else {
                Ok(ProcessResponse::default())
            }
        }));
        let dispatcher = Dispatcher::new(queue.clone(), Arc::clone(&processor)).per_cycle(1);
        dispatcher.cycle().await.unwrap();

        let snapshot = queue.enumerate().await.unwrap();
        let mut names: Vec<&str> = snapshot.queued.iter().map(|k| k.name()).collect();
        names.sort_unstable();
        // child3 was never attempted; the parent is back with the attempt counted.
        assert_eq!(names, vec!["child1", "parent"]);
        let parent = snapshot.queued.iter().find(|k| k.name() == "parent").unwrap();
        assert_eq!(parent.attempts(), 1);
    }

    #[tokio::test]
    async fn self_fanout_requeues_through_the_dual_state_rule() {
        let queue = test_queue();
        queue.queue("k", QueueOptions::default()).await.unwrap();

        let processor = Arc::new(TestProcessor::new(|req| {
            if req.attempts == 0 && req.priority == 0 {
                Ok(ProcessResponse {
                    queue_keys: vec![QueueKeyRequest::new(req.key.clone()).priority(1)],
                    ..ProcessResponse::default()
                })
            } else {
                Ok(ProcessResponse::default())
            }
        }));
        let dispatcher = Dispatcher::new(queue.clone(), Arc::clone(&processor));
        dispatcher.cycle().await.unwrap();

        let snapshot = queue.enumerate().await.unwrap();
        assert_eq!(snapshot.queued.len(), 1);
        assert_eq!(snapshot.queued[0].name(), "k");
        assert_eq!(snapshot.queued[0].priority(), 1);
        assert_eq!(snapshot.queued[0].attempts(), 0);

        dispatcher.cycle().await.unwrap();
        assert_eq!(states(&queue).await, (vec![], vec![], vec![]));
        assert_eq!(processor.calls(), vec!["k", "k"]);
    }

    #[tokio::test]
    async fn non_retriable_errors_complete_without_retry() {
        let queue = test_queue();
        queue.queue("k", QueueOptions::default()).await.unwrap();

        let processor = Arc::new(TestProcessor::new(|_| {
            Err(ReconcileError::non_retriable("unparseable key"))
        }));
        let dispatcher = Dispatcher::new(queue.clone(), Arc::clone(&processor));
        dispatcher.cycle().await.unwrap();

        assert_eq!(processor.calls(), vec!["k"]);
        assert_eq!(states(&queue).await, (vec![], vec![], vec![]));
    }

    #[tokio::test]
    async fn orphaned_keys_are_requeued_and_never_invoked() {
        let queue = test_queue();
        let now = Utc::now();
        queue
            .backend()
            .update(
                "stale",
                Box::new(move |_| {
                    Ok(Some(KeyState {
                        key: "stale".into(),
                        priority: 0,
                        not_before: now,
                        attempts: 0,
                        first_seen: now,
                        last_transition: now,
                        phase: KeyPhase::InProgress {
                            owner_id: "worker-crashed".into(),
                            lease_expires_at: now - ChronoDuration::seconds(60),
                            requeue_on_complete: None,
                        },
                    }))
                }),
            )
            .await
            .unwrap();

        let processor = Arc::new(TestProcessor::succeeding());
        let dispatcher = Dispatcher::new(queue.clone(), Arc::clone(&processor));

        let outcome = dispatcher.cycle().await.unwrap();
        assert_eq!(outcome.orphans_requeued, 1);
        assert_eq!(outcome.launched, 0);
        assert!(processor.calls().is_empty());
        let snapshot = queue.enumerate().await.unwrap();
        assert_eq!(snapshot.queued.len(), 1);

        // The next cycle picks the recovered key up normally.
        dispatcher.cycle().await.unwrap();
        assert_eq!(processor.calls(), vec!["stale"]);
        assert_eq!(states(&queue).await, (vec![], vec![], vec![]));
    }

    #[tokio::test]
    async fn launches_respect_concurrency_and_per_cycle_budgets() {
        let queue = test_queue();
        for key in ["a", "b", "c", "d", "e"] {
            queue.queue(key, QueueOptions::default()).await.unwrap();
        }

        let processor = Arc::new(TestProcessor::succeeding());
        let dispatcher = Dispatcher::new(queue.clone(), Arc::clone(&processor)).concurrency(2);
        assert_eq!(dispatcher.cycle().await.unwrap().launched, 2);

        let dispatcher = dispatcher.per_cycle(1);
        assert_eq!(dispatcher.cycle().await.unwrap().launched, 1);
        assert_eq!(processor.calls().len(), 3);
    }

    #[tokio::test]
    async fn live_in_progress_keys_consume_concurrency_slots() {
        let queue = test_queue();
        let now = Utc::now();
        queue
            .backend()
            .update(
                "busy",
                Box::new(move |_| {
                    Ok(Some(KeyState {
                        key: "busy".into(),
                        priority: 0,
                        not_before: now,
                        attempts: 0,
                        first_seen: now,
                        last_transition: now,
                        phase: KeyPhase::InProgress {
                            owner_id: "worker-other".into(),
                            lease_expires_at: now + ChronoDuration::seconds(60),
                            requeue_on_complete: None,
                        },
                    }))
                }),
            )
            .await
            .unwrap();
        for key in ["a", "b", "c"] {
            queue.queue(key, QueueOptions::default()).await.unwrap();
        }

        let processor = Arc::new(TestProcessor::succeeding());
        let dispatcher = Dispatcher::new(queue.clone(), Arc::clone(&processor)).concurrency(2);
        let outcome = dispatcher.cycle().await.unwrap();
        assert_eq!(outcome.active, 1);
        assert_eq!(outcome.launched, 1);
    }

    #[tokio::test]
    async fn transitions_survive_cancellation_of_the_cycle() {
        let queue = test_queue();
        queue.queue("k", QueueOptions::default()).await.unwrap();

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let processor = {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            Arc::new(BlockingProcessor { started, release })
        };

        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), Arc::clone(&processor)));
        let cycle = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                let _ = dispatcher.cycle().await;
            })
        };

        started.notified().await;
        // Cancel the cycle while the worker is mid-attempt.
        cycle.abort();
        release.notify_one();

        // The worker task is independent of the cycle future, so the
        // completion transition still lands.
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if queue.enumerate().await.unwrap().in_progress.is_empty() {
                break;
            }
        }
        assert_eq!(states(&queue).await, (vec![], vec![], vec![]));
    }

    struct BlockingProcessor {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Processor for BlockingProcessor {
        async fn process(&self, _request: ProcessRequest) -> Verdict {
            self.started.notify_one();
            self.release.notified().await;
            Ok(ProcessResponse::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_processes_on_pulse_and_stops_on_shutdown() {
        let queue = test_queue();
        queue.queue("k", QueueOptions::default()).await.unwrap();

        let processor = Arc::new(TestProcessor::succeeding());
        let dispatcher = Dispatcher::new(queue.clone(), Arc::clone(&processor))
            .tick(Duration::from_secs(3600));
        let pulse = dispatcher.pulse_handle();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let running = tokio::spawn(dispatcher.run(async move {
            let _ = shutdown_rx.await;
        }));

        // The interval's first tick fires immediately and drains the queue.
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if !processor.calls().is_empty() {
                break;
            }
        }
        assert_eq!(processor.calls(), vec!["k"]);

        queue.queue("k2", QueueOptions::default()).await.unwrap();
        pulse.pulse();
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if processor.calls().len() == 2 {
                break;
            }
        }
        assert_eq!(processor.calls(), vec!["k", "k2"]);

        shutdown_tx.send(()).unwrap();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_extends_the_lease_during_long_attempts() {
        let config = QueueConfig {
            lease_duration: Duration::from_millis(300),
            ..test_config()
        };
        let queue = WorkQueue::with_config(MemoryBackend::new(), config);
        queue.queue("k", QueueOptions::default()).await.unwrap();

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let processor = Arc::new(BlockingProcessor {
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        });
        let dispatcher = Dispatcher::new(queue.clone(), Arc::clone(&processor));
        let cycle = tokio::spawn(async move { dispatcher.cycle().await });

        started.notified().await;
        // Wait out more than a full lease; heartbeats must keep it live.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let snapshot = queue.enumerate().await.unwrap();
        assert_eq!(snapshot.in_progress.len(), 1);
        assert!(!snapshot.in_progress[0].is_orphaned());

        release.notify_one();
        cycle.await.unwrap().unwrap();
        assert_eq!(states(&queue).await, (vec![], vec![], vec![]));
    }
}
