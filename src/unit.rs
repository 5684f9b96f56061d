//! Work units: their identity, their execution context and what they produce.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::Alert;
use crate::store::timestamp;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Natural identity of a unit; two enqueues with equal keys coalesce.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WorkKey {
    AlertSweep {
        #[serde(rename = "pupilId")]
        pupil_id: String,
    },
    AggregateRecompute {
        #[serde(rename = "classId")]
        class_id: String,
        #[serde(rename = "periodId")]
        period_id: String,
    },
}

impl WorkKey {
    pub fn sweep(pupil_id: impl Into<String>) -> Self {
        WorkKey::AlertSweep {
            pupil_id: pupil_id.into(),
        }
    }

    pub fn recompute(class_id: impl Into<String>, period_id: impl Into<String>) -> Self {
        WorkKey::AggregateRecompute {
            class_id: class_id.into(),
            period_id: period_id.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkKey::AlertSweep { pupil_id } => write!(f, "alert_sweep:{}", pupil_id),
            WorkKey::AggregateRecompute {
                class_id,
                period_id,
            } => write!(f, "aggregate_recompute:{}:{}", class_id, period_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateReady {
    pub class_id: String,
    pub period_id: String,
    pub subject_count: usize,
    pub pupil_count: usize,
    pub completed_at: String,
}

#[derive(Debug, Clone)]
pub enum UnitOutcome {
    Swept { new_alerts: Vec<Alert> },
    Recomputed(AggregateReady),
    /// The period was locked when the unit tried to write.
    Frozen { period_id: String },
}

/// Everything a unit needs while it runs on a worker's connections.
pub struct UnitContext<'a> {
    pub read: &'a Connection,
    pub write: &'a Connection,
    pub config: &'a EngineConfig,
    pub clock: &'a dyn Clock,
    pub cancel: &'a CancellationToken,
    pub key: &'a WorkKey,
}

impl UnitContext<'_> {
    /// Cooperative cancellation point between subunits.
    pub fn checkpoint(&self) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Append to the operator queue; shown by `operator.issues`.
pub fn record_operator_issue(
    conn: &Connection,
    kind: &str,
    key: &WorkKey,
    pupil_id: Option<&str>,
    message: &str,
    at: DateTime<Utc>,
) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO operator_issues(id, kind, unit_key, pupil_id, message, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            kind,
            key.to_string(),
            pupil_id,
            message,
            timestamp(at),
        ),
    )?;
    Ok(())
}

pub fn ready_event_json(ready: &AggregateReady) -> serde_json::Value {
    json!({
        "type": "AggregateReadyEvent",
        "classId": ready.class_id,
        "periodId": ready.period_id,
        "subjectCount": ready.subject_count,
        "pupilCount": ready.pupil_count,
        "completedAt": ready.completed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_serialize_with_a_kind_tag() {
        let k = WorkKey::recompute("C1", "T1");
        assert_eq!(
            k.to_json(),
            json!({ "kind": "AggregateRecompute", "classId": "C1", "periodId": "T1" })
        );
        let back: WorkKey = serde_json::from_value(k.to_json()).expect("parse");
        assert_eq!(back, k);
        assert_eq!(WorkKey::sweep("P1").to_string(), "alert_sweep:P1");
    }
}
