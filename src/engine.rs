//! Owns the runtime, the scheduler and everything units share for one workspace.

use crate::clock::{next_local_occurrence, Clock, FixedClock, SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::db;
use crate::error::EngineResult;
use crate::event_store::Snapshot;
use crate::publisher::Publisher;
use crate::runner::{current_clock, ClockCell, WorkspaceRunner};
use crate::scheduler::{Offer, Scheduler, SchedulerStatus};
use crate::unit::WorkKey;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::runtime::Runtime;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodicReport {
    pub pupils: usize,
    pub class_periods: usize,
    pub accepted: usize,
    pub coalesced: usize,
    pub dropped: usize,
}

pub struct Engine {
    runtime: Runtime,
    workspace: PathBuf,
    scheduler: Scheduler,
    config: Arc<RwLock<EngineConfig>>,
    clock: ClockCell,
    fixed: Option<Arc<FixedClock>>,
    publisher: Arc<Publisher>,
}

impl Engine {
    pub fn start(workspace: &Path, cfg: EngineConfig, fixed_now: Option<DateTime<Utc>>) -> anyhow::Result<Engine> {
        let tz = cfg.tz().map_err(anyhow::Error::msg)?;
        let fixed = fixed_now.map(|now| Arc::new(FixedClock::new(tz, now)));
        let clock: SharedClock = match &fixed {
            Some(f) => f.clone(),
            None => Arc::new(SystemClock::new(tz)),
        };
        let clock: ClockCell = Arc::new(RwLock::new(clock));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("saed-rt")
            .enable_time()
            .build()
            .context("failed to build engine runtime")?;

        let workers = cfg.worker_count;
        let publisher = Arc::new(Publisher::new(workspace, &cfg));
        let config = Arc::new(RwLock::new(cfg));
        let runner = Arc::new(WorkspaceRunner::new(
            workspace,
            workers,
            config.clone(),
            clock.clone(),
            publisher.clone(),
        ));
        let scheduler = Scheduler::new(runner, config.clone());
        {
            let _enter = runtime.enter();
            scheduler.start_workers(workers);
        }

        let engine = Engine {
            runtime,
            workspace: workspace.to_path_buf(),
            scheduler,
            config,
            clock,
            fixed,
            publisher,
        };

        // Deliveries interrupted by a previous shutdown resume from their checkpoints.
        match engine.replay() {
            Ok(0) => {}
            Ok(n) => tracing::info!(delivered = n, "replayed undelivered alerts"),
            Err(e) => tracing::warn!(error = %e, "startup replay failed"),
        }
        if engine.fixed.is_none() {
            engine.spawn_ticker();
        }
        tracing::info!(workspace = %engine.workspace.display(), workers, "engine started");
        Ok(engine)
    }

    fn spawn_ticker(&self) {
        let scheduler = self.scheduler.clone();
        let config = self.config.clone();
        let clock = self.clock.clone();
        let workspace = self.workspace.clone();
        let shutdown = scheduler.shutdown_token();
        self.runtime.spawn(async move {
            loop {
                let cfg = read_config(&config);
                let now_clock = current_clock(&clock);
                let (Ok(tz), Ok(at)) = (cfg.tz(), cfg.sweep_time()) else {
                    tracing::error!("invalid sweep schedule; periodic sweep stopped");
                    return;
                };
                let now = now_clock.now();
                let next = next_local_occurrence(now, tz, at);
                let wait = (next - now).to_std().unwrap_or(Duration::from_secs(1));
                tracing::debug!(next = %next, "next periodic sweep scheduled");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                if !read_config(&config).periodic_enabled {
                    continue;
                }
                let ws = workspace.clone();
                let today = current_clock(&clock).today();
                let keys = tokio::task::spawn_blocking(move || periodic_keys(&ws, today)).await;
                match keys {
                    Ok(Ok(keys)) => {
                        let report = offer_all(&scheduler, keys);
                        tracing::info!(
                            accepted = report.accepted,
                            coalesced = report.coalesced,
                            dropped = report.dropped,
                            "periodic sweep enqueued"
                        );
                    }
                    Ok(Err(e)) => tracing::error!(error = %e, "periodic sweep could not list work"),
                    Err(e) => tracing::error!(error = %e, "periodic sweep task failed"),
                }
            }
        });
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn config(&self) -> EngineConfig {
        read_config(&self.config)
    }

    /// Install a validated config. Worker count changes take effect on the next workspace open.
    pub fn apply_config(&mut self, cfg: EngineConfig) -> anyhow::Result<()> {
        let previous = self.config();
        if cfg.timezone != previous.timezone {
            let tz = cfg.tz().map_err(anyhow::Error::msg)?;
            let next: SharedClock = match &self.fixed {
                Some(f) => {
                    let moved = Arc::new(FixedClock::new(tz, f.now()));
                    self.fixed = Some(moved.clone());
                    moved
                }
                None => Arc::new(SystemClock::new(tz)),
            };
            match self.clock.write() {
                Ok(mut c) => *c = next,
                Err(poisoned) => *poisoned.into_inner() = next,
            }
        }
        if cfg.worker_count != previous.worker_count {
            tracing::info!(
                workers = cfg.worker_count,
                "worker count change applies when the workspace is reopened"
            );
        }
        self.publisher.configure(&cfg);
        match self.config.write() {
            Ok(mut c) => *c = cfg,
            Err(poisoned) => *poisoned.into_inner() = cfg,
        }
        Ok(())
    }

    pub fn now(&self) -> DateTime<Utc> {
        current_clock(&self.clock).now()
    }

    pub fn is_clock_fixed(&self) -> bool {
        self.fixed.is_some()
    }

    /// Move a fixed clock. Returns false when the engine runs on host time.
    pub fn set_clock(&self, now: DateTime<Utc>) -> bool {
        match &self.fixed {
            Some(f) => {
                f.set(now);
                true
            }
            None => false,
        }
    }

    /// Event-driven producer; blocks while the queue is full.
    pub fn enqueue_event(&self, key: WorkKey) -> Offer {
        self.runtime.block_on(self.scheduler.enqueue_event(key))
    }

    /// Periodic producer: sweep every active pupil, recompute every active class period.
    pub fn run_daily_sweep(&self) -> EngineResult<PeriodicReport> {
        let today = current_clock(&self.clock).today();
        let keys = periodic_keys(&self.workspace, today)?;
        Ok(offer_all(&self.scheduler, keys))
    }

    pub fn drain(&self, timeout: Duration) -> bool {
        self.runtime.block_on(self.scheduler.drain(timeout))
    }

    pub fn status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    pub fn replay(&self) -> EngineResult<usize> {
        let conn = db::open_connection(&self.workspace)?;
        self.publisher.flush_all(&conn, self.now())
    }

    pub fn published_events(&self) -> Vec<Value> {
        self.publisher.memory_events()
    }

    pub fn shutdown(self) {
        let deadline = self.config().drain_deadline();
        let clean = self.runtime.block_on(self.scheduler.shutdown(deadline));
        if !clean {
            tracing::warn!("drain deadline passed before every worker stopped");
        }
        self.runtime.shutdown_timeout(Duration::from_secs(1));
        tracing::info!(workspace = %self.workspace.display(), "engine stopped");
    }
}

fn read_config(config: &RwLock<EngineConfig>) -> EngineConfig {
    match config.read() {
        Ok(c) => c.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn periodic_keys(workspace: &Path, today: chrono::NaiveDate) -> EngineResult<Vec<WorkKey>> {
    let conn = db::open_connection(workspace)?;
    let snapshot = Snapshot::open(&conn)?;
    let mut keys: Vec<WorkKey> = snapshot
        .list_active_pupils(today)?
        .into_iter()
        .map(WorkKey::sweep)
        .collect();
    keys.extend(
        snapshot
            .list_active_class_periods(today)?
            .into_iter()
            .map(|(class_id, period_id)| WorkKey::recompute(class_id, period_id)),
    );
    Ok(keys)
}

fn offer_all(scheduler: &Scheduler, keys: Vec<WorkKey>) -> PeriodicReport {
    let mut report = PeriodicReport::default();
    for key in keys {
        match &key {
            WorkKey::AlertSweep { .. } => report.pupils += 1,
            WorkKey::AggregateRecompute { .. } => report.class_periods += 1,
        }
        match scheduler.offer_periodic(key) {
            Offer::Accepted => report.accepted += 1,
            Offer::Coalesced | Offer::RerunMarked => report.coalesced += 1,
            Offer::Full => report.dropped += 1,
        }
    }
    report
}
