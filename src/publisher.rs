//! Delivers newly opened alerts to downstream sinks, at least once.
//!
//! Each (sink, pupil) pair keeps the sequence number of the last alert it
//! accepted. A flush sends every alert past that checkpoint and advances it
//! one alert at a time, so a crash between delivery and checkpoint only ever
//! repeats an event, never skips one.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::Alert;
use crate::store::{alert_row, timestamp, ALERT_COLUMNS};
use crate::unit::{ready_event_json, AggregateReady};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

pub const OUTBOX_DIR: &str = "outbox";

pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, event: &Value) -> EngineResult<()>;
}

/// Appends one JSON document per line to `outbox/<name>.jsonl`.
pub struct JsonlSink {
    name: String,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(workspace: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: workspace.join(OUTBOX_DIR).join(format!("{}.jsonl", name)),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AlertSink for JsonlSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&self, event: &Value) -> EngineResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let unavailable = |e: std::io::Error| {
            EngineError::Transient(format!("sink {} unavailable: {}", self.name, e))
        };
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(unavailable)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(unavailable)?;
        let line = serde_json::to_string(event)
            .map_err(|e| EngineError::Permanent(format!("unserializable event: {}", e)))?;
        writeln!(file, "{}", line).map_err(unavailable)?;
        file.flush().map_err(unavailable)
    }
}

/// Keeps delivered events in memory; `publisher.peek` reads them back.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Value>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<Value> {
        self.events
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

impl AlertSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn deliver(&self, event: &Value) -> EngineResult<()> {
        self.events
            .lock()
            .map_err(|_| EngineError::Transient("memory sink poisoned".into()))?
            .push(event.clone());
        Ok(())
    }
}

pub fn alert_event_json(alert: &Alert) -> Value {
    json!({
        "type": "AlertEvent",
        "alertId": alert.id,
        "seq": alert.seq,
        "pupilId": alert.pupil_id,
        "kind": alert.kind.family(),
        "kindKey": alert.kind.key(),
        "window": {
            "start": alert.window_start.to_string(),
            "end": alert.window_end.to_string(),
        },
        "threshold": alert.threshold,
        "observedValue": alert.observed_value,
        "detail": alert.detail,
        "createdAt": alert.created_at,
    })
}

pub struct Publisher {
    workspace: PathBuf,
    memory: Arc<MemorySink>,
    sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
}

impl Publisher {
    pub fn new(workspace: &Path, cfg: &EngineConfig) -> Self {
        let publisher = Self {
            workspace: workspace.to_path_buf(),
            memory: Arc::new(MemorySink::default()),
            sinks: RwLock::new(Vec::new()),
        };
        publisher.configure(cfg);
        publisher
    }

    /// Rebuild the sink list from `cfg.sinks`. The memory sink keeps its events.
    pub fn configure(&self, cfg: &EngineConfig) {
        let mut next: Vec<Arc<dyn AlertSink>> = Vec::new();
        for name in &cfg.sinks {
            match name.as_str() {
                "memory" => next.push(self.memory.clone()),
                "jsonl" => next.push(Arc::new(JsonlSink::new(&self.workspace, "jsonl"))),
                other => tracing::warn!(sink = other, "ignoring unknown sink"),
            }
        }
        match self.sinks.write() {
            Ok(mut sinks) => *sinks = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn sinks(&self) -> Vec<Arc<dyn AlertSink>> {
        match self.sinks.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn memory_events(&self) -> Vec<Value> {
        self.memory.events()
    }

    /// Deliver this pupil's alerts past each sink's checkpoint. Returns deliveries made.
    pub fn flush_pupil(&self, conn: &Connection, pupil_id: &str, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut delivered = 0;
        for sink in self.sinks() {
            let after = checkpoint(conn, sink.name(), pupil_id)?;
            for alert in alerts_after(conn, pupil_id, after)? {
                sink.deliver(&alert_event_json(&alert))?;
                advance_checkpoint(conn, sink.name(), pupil_id, alert.seq, now)?;
                delivered += 1;
            }
        }
        if delivered > 0 {
            tracing::debug!(pupil_id, delivered, "alerts published");
        }
        Ok(delivered)
    }

    /// Flush every pupil that has alerts. Used at startup and by `publisher.replay`.
    pub fn flush_all(&self, conn: &Connection, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut stmt = conn.prepare("SELECT DISTINCT pupil_id FROM alerts ORDER BY pupil_id")?;
        let pupils = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut total = 0;
        for pupil in pupils {
            total += self.flush_pupil(conn, &pupil, now)?;
        }
        Ok(total)
    }

    /// Best effort: a sink failure is logged and the event is not retried.
    pub fn announce_ready(&self, ready: &AggregateReady) {
        let event = ready_event_json(ready);
        for sink in self.sinks() {
            if let Err(e) = sink.deliver(&event) {
                tracing::warn!(
                    sink = sink.name(),
                    class_id = %ready.class_id,
                    period_id = %ready.period_id,
                    error = %e,
                    "aggregate ready event not delivered"
                );
            }
        }
    }
}

fn checkpoint(conn: &Connection, sink: &str, pupil_id: &str) -> EngineResult<i64> {
    let last: Option<i64> = conn
        .query_row(
            "SELECT last_seq FROM publisher_checkpoints WHERE sink = ? AND pupil_id = ?",
            (sink, pupil_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(last.unwrap_or(0))
}

fn advance_checkpoint(
    conn: &Connection,
    sink: &str,
    pupil_id: &str,
    seq: i64,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO publisher_checkpoints(sink, pupil_id, last_seq, updated_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(sink, pupil_id) DO UPDATE SET
           last_seq = MAX(last_seq, excluded.last_seq),
           updated_at = excluded.updated_at",
        (sink, pupil_id, seq, timestamp(now)),
    )?;
    Ok(())
}

fn alerts_after(conn: &Connection, pupil_id: &str, after: i64) -> EngineResult<Vec<Alert>> {
    let sql = format!(
        "SELECT {} FROM alerts WHERE pupil_id = ? AND seq > ? ORDER BY seq",
        ALERT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((pupil_id, after), alert_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().collect()
}
