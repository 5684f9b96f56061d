//! Bounded, deduplicating work queue and the worker pool that drains it.
//!
//! Keys are unique across `ready`, delayed retries and `in_flight`: an offer
//! for a queued key coalesces, an offer for an in-flight key marks it for one
//! follow-up run. Units with the same key therefore never overlap, while
//! distinct keys run in parallel on the workers.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::unit::{UnitOutcome, WorkKey};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Executes units on blocking threads. `worker` identifies the calling worker
/// so implementations can keep per-worker resources.
pub trait UnitRunner: Send + Sync + 'static {
    fn run(&self, worker: usize, key: &WorkKey, cancel: &CancellationToken) -> EngineResult<UnitOutcome>;

    /// Persist a unit that will not be retried.
    fn dead_letter(&self, key: &WorkKey, attempts: u32, kind: ErrorKind, message: &str) -> EngineResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// An identical unit is already queued or waiting for a retry.
    Coalesced,
    /// An identical unit is running; it will run once more afterwards.
    RerunMarked,
    Full,
}

#[derive(Debug, Clone)]
struct Job {
    key: WorkKey,
    attempt: u32,
}

struct InFlight {
    rerun: bool,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Job>,
    /// Keys in `ready` plus keys waiting out a retry backoff.
    queued: HashSet<WorkKey>,
    in_flight: HashMap<WorkKey, InFlight>,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.in_flight.is_empty()
    }
}

#[derive(Default)]
struct Stats {
    accepted: AtomicU64,
    coalesced: AtomicU64,
    reruns: AtomicU64,
    dropped_periodic: AtomicU64,
    succeeded: AtomicU64,
    frozen: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    cancelled: AtomicU64,
    deadline_breaches: AtomicU64,
    transient_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub workers: usize,
    pub queue_depth: usize,
    pub waiting_retries: usize,
    pub capacity: usize,
    pub in_flight: Vec<String>,
    pub accepted: u64,
    pub coalesced: u64,
    pub reruns: u64,
    pub dropped_periodic: u64,
    pub succeeded: u64,
    pub frozen: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub cancelled: u64,
    pub deadline_breaches: u64,
    pub transient_failures: u64,
    pub transient_last_hour: usize,
    pub shutting_down: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    work_ready: Notify,
    space_ready: Notify,
    idle: Notify,
    runner: Arc<dyn UnitRunner>,
    config: Arc<RwLock<EngineConfig>>,
    stats: Stats,
    transient_log: Mutex<VecDeque<Instant>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn UnitRunner>, config: Arc<RwLock<EngineConfig>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                work_ready: Notify::new(),
                space_ready: Notify::new(),
                idle: Notify::new(),
                runner,
                config,
                stats: Stats::default(),
                transient_log: Mutex::new(VecDeque::new()),
                shutdown: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn `count` workers on the current tokio runtime.
    pub fn start_workers(&self, count: usize) {
        let mut workers = lock(&self.inner.workers);
        for _ in 0..count {
            let worker = workers.len();
            let inner = self.inner.clone();
            workers.push(tokio::spawn(async move {
                inner.worker_loop(worker).await;
            }));
        }
        info!(workers = workers.len(), "scheduler workers started");
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Event-driven producer: waits for room when the queue is full.
    pub async fn enqueue_event(&self, key: WorkKey) -> Offer {
        loop {
            let mut space = pin!(self.inner.space_ready.notified());
            space.as_mut().enable();
            match self.inner.offer(key.clone()) {
                Offer::Full => {
                    debug!(unit = %key, "queue full; event producer waiting");
                    tokio::select! {
                        _ = &mut space => {}
                        _ = self.inner.shutdown.cancelled() => return Offer::Full,
                    }
                }
                other => return other,
            }
        }
    }

    /// Periodic producer: drops the unit when the queue is full. The next tick reconsiders it.
    pub fn offer_periodic(&self, key: WorkKey) -> Offer {
        let offer = self.inner.offer(key);
        if offer == Offer::Full {
            bump(&self.inner.stats.dropped_periodic);
        }
        offer
    }

    /// Wait until nothing is queued, retrying or running. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut idle = pin!(self.inner.idle.notified());
            idle.as_mut().enable();
            if lock(&self.inner.state).is_idle() {
                return true;
            }
            tokio::select! {
                _ = &mut idle => {}
                _ = tokio::time::sleep_until(deadline) => return lock(&self.inner.state).is_idle(),
            }
        }
    }

    /// Cancel every unit and wait for the workers, at most `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        self.inner.shutdown.cancel();
        self.inner.work_ready.notify_waiters();
        let handles: Vec<JoinHandle<()>> = lock(&self.inner.workers).drain(..).collect();
        let joined = tokio::time::timeout(deadline, async {
            for h in handles {
                let _ = h.await;
            }
        })
        .await;
        let left: Vec<String> = {
            let state = lock(&self.inner.state);
            state
                .queued
                .iter()
                .chain(state.in_flight.keys())
                .map(|k| k.to_string())
                .collect()
        };
        if !left.is_empty() {
            warn!(units = ?left, "scheduler stopped with unfinished units");
        }
        joined.is_ok()
    }

    pub fn status(&self) -> SchedulerStatus {
        let s = &self.inner.stats;
        let (queue_depth, waiting_retries, mut in_flight) = {
            let state = lock(&self.inner.state);
            (
                state.ready.len(),
                state.queued.len().saturating_sub(state.ready.len()),
                state
                    .in_flight
                    .keys()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>(),
            )
        };
        in_flight.sort();
        SchedulerStatus {
            workers: lock(&self.inner.workers).len(),
            queue_depth,
            waiting_retries,
            capacity: self.inner.capacity(),
            in_flight,
            accepted: s.accepted.load(Ordering::Relaxed),
            coalesced: s.coalesced.load(Ordering::Relaxed),
            reruns: s.reruns.load(Ordering::Relaxed),
            dropped_periodic: s.dropped_periodic.load(Ordering::Relaxed),
            succeeded: s.succeeded.load(Ordering::Relaxed),
            frozen: s.frozen.load(Ordering::Relaxed),
            retried: s.retried.load(Ordering::Relaxed),
            dead_lettered: s.dead_lettered.load(Ordering::Relaxed),
            cancelled: s.cancelled.load(Ordering::Relaxed),
            deadline_breaches: s.deadline_breaches.load(Ordering::Relaxed),
            transient_failures: s.transient_failures.load(Ordering::Relaxed),
            transient_last_hour: self.inner.transient_last_hour(),
            shutting_down: self.inner.shutdown.is_cancelled(),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn config(&self) -> EngineConfig {
        match self.config.read() {
            Ok(cfg) => cfg.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn capacity(&self) -> usize {
        self.config().queue_capacity.max(1)
    }

    fn offer(&self, key: WorkKey) -> Offer {
        let capacity = self.capacity();
        let mut state = lock(&self.state);
        if let Some(running) = state.in_flight.get_mut(&key) {
            running.rerun = true;
            bump(&self.stats.reruns);
            return Offer::RerunMarked;
        }
        if state.queued.contains(&key) {
            bump(&self.stats.coalesced);
            return Offer::Coalesced;
        }
        if state.ready.len() >= capacity {
            return Offer::Full;
        }
        state.queued.insert(key.clone());
        state.ready.push_back(Job { key, attempt: 0 });
        drop(state);
        bump(&self.stats.accepted);
        self.work_ready.notify_one();
        Offer::Accepted
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        loop {
            let job = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                job = self.next_job() => job,
            };
            let span = tracing::info_span!("unit", unit = %job.key, attempt = job.attempt, worker);
            self.process(worker, job).instrument(span).await;
        }
        debug!(worker, "worker stopped");
    }

    async fn next_job(&self) -> Job {
        loop {
            let mut ready = pin!(self.work_ready.notified());
            ready.as_mut().enable();
            {
                let mut state = lock(&self.state);
                if let Some(job) = state.ready.pop_front() {
                    state.queued.remove(&job.key);
                    state.in_flight.insert(
                        job.key.clone(),
                        InFlight {
                            rerun: false,
                            cancel: self.shutdown.child_token(),
                        },
                    );
                    drop(state);
                    self.space_ready.notify_waiters();
                    return job;
                }
            }
            ready.await;
        }
    }

    async fn process(self: &Arc<Self>, worker: usize, job: Job) {
        let cfg = self.config();
        let cancel = {
            let state = lock(&self.state);
            match state.in_flight.get(&job.key) {
                Some(f) => f.cancel.clone(),
                None => self.shutdown.child_token(),
            }
        };

        let runner = self.runner.clone();
        let key = job.key.clone();
        let token = cancel.clone();
        let started = Instant::now();
        let mut handle = tokio::task::spawn_blocking(move || runner.run(worker, &key, &token));
        let result = match tokio::time::timeout(cfg.unit_deadline(), &mut handle).await {
            Ok(joined) => joined.map_err(EngineError::from).and_then(|r| r),
            Err(_) => {
                cancel.cancel();
                bump(&self.stats.deadline_breaches);
                error!(
                    deadline_ms = cfg.unit_deadline_ms,
                    "unit deadline exceeded; cancelling and rolling back"
                );
                // The unit aborts at its next checkpoint; its transaction rolls back on drop.
                match handle.await {
                    Ok(Ok(outcome)) => Ok(outcome),
                    _ => Err(EngineError::DeadlineExceeded),
                }
            }
        };
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "unit attempt finished");
        self.settle(job, result, &cfg).await;
    }

    async fn settle(self: &Arc<Self>, job: Job, result: EngineResult<UnitOutcome>, cfg: &EngineConfig) {
        let mut retry_after: Option<Duration> = None;
        match result {
            Ok(UnitOutcome::Frozen { period_id }) => {
                bump(&self.stats.frozen);
                info!(period_id = %period_id, "unit completed as a no-op on a locked period");
            }
            Ok(_) => {
                bump(&self.stats.succeeded);
            }
            Err(e) => match e.kind() {
                ErrorKind::LockedPeriod => {
                    bump(&self.stats.frozen);
                }
                ErrorKind::Cancelled if self.shutdown.is_cancelled() => {
                    bump(&self.stats.cancelled);
                    warn!("unit cancelled by shutdown");
                }
                kind => {
                    if kind == ErrorKind::Transient {
                        self.note_transient(cfg.transient_error_ceiling);
                    }
                    let retryable = e.is_retryable() || kind == ErrorKind::Cancelled;
                    if retryable && job.attempt < cfg.max_retries {
                        let next = job.attempt + 1;
                        let delay = cfg.backoff_delay(next);
                        bump(&self.stats.retried);
                        warn!(
                            error = %e,
                            kind = kind.as_str(),
                            retry_in_ms = delay.as_millis() as u64,
                            "unit failed; retrying"
                        );
                        retry_after = Some(delay);
                    } else {
                        self.park(&job, &e).await;
                    }
                }
            },
        }

        let rerun = {
            let mut state = lock(&self.state);
            let rerun = state
                .in_flight
                .remove(&job.key)
                .map(|f| f.rerun)
                .unwrap_or(false);
            if retry_after.is_some() {
                state.queued.insert(job.key.clone());
            } else if rerun && !self.shutdown.is_cancelled() && !state.queued.contains(&job.key) {
                state.queued.insert(job.key.clone());
                state.ready.push_back(Job {
                    key: job.key.clone(),
                    attempt: 0,
                });
            }
            rerun
        };
        if rerun && retry_after.is_none() {
            debug!("running unit again for writes that arrived while it ran");
            self.work_ready.notify_one();
        }
        if let Some(delay) = retry_after {
            self.schedule_retry(Job {
                key: job.key,
                attempt: job.attempt + 1,
            }, delay);
        }
        self.notify_if_idle();
    }

    async fn park(&self, job: &Job, e: &EngineError) {
        bump(&self.stats.dead_lettered);
        let attempts = job.attempt + 1;
        error!(error = %e, kind = e.kind().as_str(), attempts, "unit dead-lettered");
        let runner = self.runner.clone();
        let key = job.key.clone();
        let message = e.to_string();
        let kind = e.kind();
        let stored =
            tokio::task::spawn_blocking(move || runner.dead_letter(&key, attempts, kind, &message))
                .await;
        match stored {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "failed to persist dead letter"),
            Err(e) => error!(error = %e, "dead letter task failed"),
        }
    }

    fn schedule_retry(self: &Arc<Self>, job: Job, delay: Duration) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.shutdown.cancelled() => {
                    lock(&inner.state).queued.remove(&job.key);
                    inner.notify_if_idle();
                }
                _ = tokio::time::sleep(delay) => {
                    lock(&inner.state).ready.push_back(job);
                    inner.work_ready.notify_one();
                }
            }
        });
    }

    fn notify_if_idle(&self) {
        if lock(&self.state).is_idle() {
            self.idle.notify_waiters();
        }
    }

    fn note_transient(&self, ceiling: u32) {
        bump(&self.stats.transient_failures);
        let now = Instant::now();
        let mut log = lock(&self.transient_log);
        log.push_back(now);
        while log
            .front()
            .is_some_and(|t| now.duration_since(*t) > Duration::from_secs(3600))
        {
            log.pop_front();
        }
        if log.len() == ceiling as usize + 1 {
            error!(
                ceiling,
                "transient failures in the last hour exceeded the configured ceiling"
            );
        }
    }

    fn transient_last_hour(&self) -> usize {
        let now = Instant::now();
        lock(&self.transient_log)
            .iter()
            .filter(|t| now.duration_since(**t) <= Duration::from_secs(3600))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::AggregateReady;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    type Behaviour = Box<dyn Fn(u32, &CancellationToken) -> EngineResult<UnitOutcome> + Send + Sync>;

    struct FakeRunner {
        calls: Mutex<HashMap<WorkKey, u32>>,
        behaviour: Behaviour,
        parked: Mutex<Vec<(WorkKey, u32, ErrorKind)>>,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl FakeRunner {
        fn new(
            behaviour: impl Fn(u32, &CancellationToken) -> EngineResult<UnitOutcome> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(HashMap::new()),
                behaviour: Box::new(behaviour),
                parked: Mutex::new(Vec::new()),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }

        fn calls(&self, key: &WorkKey) -> u32 {
            lock(&self.calls).get(key).copied().unwrap_or(0)
        }
    }

    impl UnitRunner for FakeRunner {
        fn run(&self, _: usize, key: &WorkKey, cancel: &CancellationToken) -> EngineResult<UnitOutcome> {
            let n = {
                let mut calls = lock(&self.calls);
                let n = calls.entry(key.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            let out = (self.behaviour)(n, cancel);
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            out
        }

        fn dead_letter(&self, key: &WorkKey, attempts: u32, kind: ErrorKind, _: &str) -> EngineResult<()> {
            lock(&self.parked).push((key.clone(), attempts, kind));
            Ok(())
        }
    }

    fn ready() -> EngineResult<UnitOutcome> {
        Ok(UnitOutcome::Recomputed(AggregateReady {
            class_id: "C".into(),
            period_id: "T".into(),
            subject_count: 0,
            pupil_count: 0,
            completed_at: String::new(),
        }))
    }

    fn config(f: impl FnOnce(&mut EngineConfig)) -> Arc<RwLock<EngineConfig>> {
        let mut cfg = EngineConfig {
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            queue_capacity: 8,
            ..EngineConfig::default()
        };
        f(&mut cfg);
        Arc::new(RwLock::new(cfg))
    }

    #[tokio::test]
    async fn identical_offers_coalesce_and_full_queue_drops_periodic() {
        let runner = FakeRunner::new(|_, _| ready());
        let sched = Scheduler::new(runner, config(|c| c.queue_capacity = 2));

        assert_eq!(sched.offer_periodic(WorkKey::sweep("a")), Offer::Accepted);
        assert_eq!(sched.offer_periodic(WorkKey::sweep("a")), Offer::Coalesced);
        assert_eq!(sched.enqueue_event(WorkKey::sweep("a")).await, Offer::Coalesced);
        assert_eq!(sched.offer_periodic(WorkKey::sweep("b")), Offer::Accepted);
        assert_eq!(sched.offer_periodic(WorkKey::sweep("c")), Offer::Full);

        let status = sched.status();
        assert_eq!(status.queue_depth, 2);
        assert_eq!(status.coalesced, 2);
        assert_eq!(status.dropped_periodic, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn event_producer_waits_for_room() {
        let runner = FakeRunner::new(|_, _| ready());
        let sched = Scheduler::new(runner.clone(), config(|c| c.queue_capacity = 1));
        assert_eq!(sched.enqueue_event(WorkKey::sweep("a")).await, Offer::Accepted);

        let producer = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.enqueue_event(WorkKey::sweep("b")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!producer.is_finished());

        sched.start_workers(1);
        let offer = tokio::time::timeout(Duration::from_secs(5), producer)
            .await
            .expect("producer unblocked")
            .expect("join");
        assert_eq!(offer, Offer::Accepted);
        assert!(sched.drain(Duration::from_secs(5)).await);
        assert_eq!(runner.calls(&WorkKey::sweep("a")), 1);
        assert_eq!(runner.calls(&WorkKey::sweep("b")), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transient_failures_retry_then_dead_letter() {
        let runner = FakeRunner::new(|_, _| Err(EngineError::Transient("busy".into())));
        let sched = Scheduler::new(runner.clone(), config(|c| c.max_retries = 2));
        sched.start_workers(2);
        sched.enqueue_event(WorkKey::recompute("C", "T")).await;
        assert!(sched.drain(Duration::from_secs(5)).await);

        assert_eq!(runner.calls(&WorkKey::recompute("C", "T")), 3);
        let parked = lock(&runner.parked).clone();
        assert_eq!(parked, vec![(WorkKey::recompute("C", "T"), 3, ErrorKind::Transient)]);
        let status = sched.status();
        assert_eq!(status.retried, 2);
        assert_eq!(status.dead_lettered, 1);
        assert_eq!(status.transient_failures, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn permanent_failure_parks_without_retry() {
        let runner = FakeRunner::new(|_, _| Err(EngineError::Permanent("no class".into())));
        let sched = Scheduler::new(runner.clone(), config(|_| {}));
        sched.start_workers(2);
        sched.enqueue_event(WorkKey::recompute("C", "T")).await;
        assert!(sched.drain(Duration::from_secs(5)).await);
        assert_eq!(runner.calls(&WorkKey::recompute("C", "T")), 1);
        assert_eq!(lock(&runner.parked)[0].1, 1);
        assert_eq!(sched.status().retried, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn offer_for_running_key_reruns_once_and_never_overlaps() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let runner = FakeRunner::new(move |n, _| {
            if n == 1 {
                let _ = lock(&release_rx).recv_timeout(Duration::from_secs(5));
            }
            ready()
        });
        let sched = Scheduler::new(runner.clone(), config(|_| {}));
        sched.start_workers(4);
        let key = WorkKey::sweep("p");
        sched.enqueue_event(key.clone()).await;

        let mut waited = 0;
        while sched.status().in_flight.is_empty() && waited < 200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            waited += 1;
        }
        assert_eq!(sched.enqueue_event(key.clone()).await, Offer::RerunMarked);
        assert_eq!(sched.enqueue_event(key.clone()).await, Offer::RerunMarked);
        release_tx.send(()).expect("release");

        assert!(sched.drain(Duration::from_secs(5)).await);
        assert_eq!(runner.calls(&key), 2);
        assert_eq!(runner.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deadline_cancels_the_unit_and_counts_a_breach() {
        let runner = FakeRunner::new(|_, cancel| {
            for _ in 0..400 {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            ready()
        });
        let sched = Scheduler::new(
            runner.clone(),
            config(|c| {
                c.unit_deadline_ms = 30;
                c.max_retries = 0;
            }),
        );
        sched.start_workers(1);
        sched.enqueue_event(WorkKey::sweep("slow")).await;
        assert!(sched.drain(Duration::from_secs(5)).await);

        let status = sched.status();
        assert_eq!(status.deadline_breaches, 1);
        assert_eq!(
            lock(&runner.parked).clone(),
            vec![(WorkKey::sweep("slow"), 1, ErrorKind::DeadlineExceeded)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_stops_workers() {
        let runner = FakeRunner::new(|_, _| ready());
        let sched = Scheduler::new(runner, config(|_| {}));
        sched.start_workers(2);
        assert!(sched.shutdown(Duration::from_secs(5)).await);
        let status = sched.status();
        assert!(status.shutting_down);
        assert_eq!(status.workers, 0);
    }
}
