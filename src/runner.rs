//! Executes work units against a workspace database.

use crate::aggregator;
use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::db;
use crate::error::{retry_transient, EngineError, EngineResult, ErrorKind};
use crate::publisher::Publisher;
use crate::scheduler::UnitRunner;
use crate::store::timestamp;
use crate::sweep;
use crate::unit::{UnitContext, UnitOutcome, WorkKey};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One read and one write connection per worker, opened on first use.
struct WorkerConns {
    read: Connection,
    write: Connection,
}

impl WorkerConns {
    fn open(workspace: &Path) -> EngineResult<Self> {
        let open = |what: &str| {
            db::open_connection(workspace)
                .map_err(|e| EngineError::Transient(format!("open {} connection: {}", what, e)))
        };
        Ok(Self {
            read: open("read")?,
            write: open("write")?,
        })
    }
}

pub type ClockCell = Arc<RwLock<SharedClock>>;

pub fn current_clock(cell: &ClockCell) -> SharedClock {
    match cell.read() {
        Ok(c) => c.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

pub struct WorkspaceRunner {
    workspace: PathBuf,
    config: Arc<RwLock<EngineConfig>>,
    clock: ClockCell,
    publisher: Arc<Publisher>,
    conns: Vec<Mutex<Option<WorkerConns>>>,
}

impl WorkspaceRunner {
    pub fn new(
        workspace: &Path,
        workers: usize,
        config: Arc<RwLock<EngineConfig>>,
        clock: ClockCell,
        publisher: Arc<Publisher>,
    ) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            config,
            clock,
            publisher,
            conns: (0..workers.max(1)).map(|_| Mutex::new(None)).collect(),
        }
    }

    fn config(&self) -> EngineConfig {
        match self.config.read() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn attempt(
        &self,
        conns: &WorkerConns,
        cfg: &EngineConfig,
        key: &WorkKey,
        cancel: &CancellationToken,
    ) -> EngineResult<UnitOutcome> {
        let clock = current_clock(&self.clock);
        let ctx = UnitContext {
            read: &conns.read,
            write: &conns.write,
            config: cfg,
            clock: clock.as_ref(),
            cancel,
            key,
        };
        let outcome = match key {
            WorkKey::AlertSweep { pupil_id } => sweep::run(&ctx, pupil_id)?,
            WorkKey::AggregateRecompute {
                class_id,
                period_id,
            } => aggregator::run(&ctx, class_id, period_id)?,
        };
        // Sweep results are committed; a failed delivery retries the unit,
        // which finds nothing new to open and replays from the checkpoint.
        if let WorkKey::AlertSweep { pupil_id } = key {
            self.publisher
                .flush_pupil(&conns.write, pupil_id, clock.now())?;
        }
        if let UnitOutcome::Recomputed(ready) = &outcome {
            self.publisher.announce_ready(ready);
        }
        Ok(outcome)
    }
}

impl UnitRunner for WorkspaceRunner {
    fn run(&self, worker: usize, key: &WorkKey, cancel: &CancellationToken) -> EngineResult<UnitOutcome> {
        let slot = self
            .conns
            .get(worker)
            .ok_or_else(|| EngineError::Permanent(format!("no connection slot for worker {}", worker)))?;
        let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let cfg = self.config();

        let result = retry_transient(cfg.inner_retry_limit, |_| {
            if guard.is_none() {
                *guard = Some(WorkerConns::open(&self.workspace)?);
            }
            let Some(conns) = guard.as_ref() else {
                return Err(EngineError::Transient("worker connections unavailable".into()));
            };
            let out = self.attempt(conns, &cfg, key, cancel);
            if matches!(&out, Err(e) if e.kind() == ErrorKind::Transient) {
                // Start the next attempt on fresh connections.
                *guard = None;
            }
            out
        });
        if result.is_err() {
            tracing::debug!(unit = %key, "unit attempt rolled back");
        }
        result
    }

    fn dead_letter(&self, key: &WorkKey, attempts: u32, kind: ErrorKind, message: &str) -> EngineResult<()> {
        let conn = db::open_connection(&self.workspace)?;
        let now = current_clock(&self.clock).now();
        conn.execute(
            "INSERT INTO dead_letters(id, unit_key, unit_json, error_kind, error, attempts, parked_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                key.to_string(),
                serde_json::to_string(&key.to_json())
                    .map_err(|e| EngineError::Permanent(e.to_string()))?,
                kind.as_str(),
                message,
                attempts,
                timestamp(now),
            ),
        )?;
        Ok(())
    }
}
