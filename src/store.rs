//! Derived-row persistence: subject and general averages, alerts, risk findings.
//!
//! Every upsert is keyed by the row's natural key. A write whose values and
//! input digest match the stored row leaves it untouched, so recomputing
//! unchanged inputs never moves `updated_at`.

use crate::error::{EngineError, EngineResult};
use crate::model::{
    parse_decimal, Alert, AlertKind, AlertState, AverageValues, CohortPlacement, Honors,
    RiskFinding,
};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub(crate) const STATE_PRESENT: &str = "PRESENT";
const STATE_ABSENT: &str = "ABSENT";

/// A detector's proposal, before it is matched against stored alerts.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateAlert {
    pub kind: AlertKind,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub threshold: i64,
    pub observed_value: i64,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct OpenOutcome {
    pub inserted: bool,
    pub alert: Alert,
}

/// One member of a ranking cohort as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortRow {
    pub pupil_id: String,
    pub weighted: Option<Decimal>,
    pub placement: Option<CohortPlacement>,
}

pub fn input_digest<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn dec_text(d: Decimal) -> String {
    d.normalize().to_string()
}

fn opt_dec(raw: Option<String>) -> Option<Decimal> {
    raw.as_deref().and_then(parse_decimal)
}

pub(crate) fn placement_from(
    rank: Option<i64>,
    size: Option<i64>,
    min: Option<String>,
    max: Option<String>,
    mean: Option<String>,
) -> Option<CohortPlacement> {
    Some(CohortPlacement {
        rank: rank?,
        class_size: size?,
        class_min: opt_dec(min)?,
        class_max: opt_dec(max)?,
        class_mean: opt_dec(mean)?,
    })
}

pub(crate) fn values_from(state: &str, simple: Option<String>, weighted: Option<String>) -> Option<AverageValues> {
    if state != STATE_PRESENT {
        return None;
    }
    Some(AverageValues {
        simple: opt_dec(simple)?,
        weighted: opt_dec(weighted)?,
    })
}

pub struct AggregateStore<'a> {
    conn: &'a Connection,
    now: DateTime<Utc>,
}

impl<'a> AggregateStore<'a> {
    pub fn new(conn: &'a Connection, now: DateTime<Utc>) -> Self {
        Self { conn, now }
    }

    fn stamp(&self) -> String {
        timestamp(self.now)
    }

    /// Fails with `LockedPeriod` when the period's grades are locked at write time.
    pub fn ensure_writable(&self, period_id: &str) -> EngineResult<()> {
        let locked: Option<i64> = self
            .conn
            .query_row(
                "SELECT grades_locked FROM periods WHERE id = ?",
                [period_id],
                |r| r.get(0),
            )
            .optional()?;
        match locked {
            None => Err(EngineError::missing("period", period_id)),
            Some(0) => Ok(()),
            Some(_) => Err(EngineError::LockedPeriod {
                period_id: period_id.to_string(),
            }),
        }
    }

    /// Returns whether the stored row changed.
    pub fn put_subject_average(
        &self,
        pupil_id: &str,
        subject_id: &str,
        period_id: &str,
        class_id: &str,
        values: Option<AverageValues>,
        digest: &str,
    ) -> EngineResult<bool> {
        self.ensure_writable(period_id)?;
        let (state, simple, weighted) = match values {
            Some(v) => (STATE_PRESENT, Some(dec_text(v.simple)), Some(dec_text(v.weighted))),
            None => (STATE_ABSENT, None, None),
        };
        let existing: Option<(String, String, Option<String>, Option<String>, String)> = self
            .conn
            .query_row(
                "SELECT class_id, state, simple_average, weighted_average, input_digest
                 FROM subject_averages
                 WHERE pupil_id = ? AND subject_id = ? AND period_id = ?",
                (pupil_id, subject_id, period_id),
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()?;
        if let Some((c, s, si, w, d)) = existing {
            if c == class_id && s == state && si == simple && w == weighted && d == digest {
                return Ok(false);
            }
        }
        // Placement is cleared here and rewritten by the ranking pass.
        self.conn.execute(
            "INSERT INTO subject_averages(
                pupil_id, subject_id, period_id, class_id, state,
                simple_average, weighted_average,
                rank, class_size, class_min, class_max, class_mean,
                input_digest, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, NULL, NULL, ?, ?)
             ON CONFLICT(pupil_id, subject_id, period_id) DO UPDATE SET
                class_id = excluded.class_id,
                state = excluded.state,
                simple_average = excluded.simple_average,
                weighted_average = excluded.weighted_average,
                rank = NULL, class_size = NULL, class_min = NULL, class_max = NULL, class_mean = NULL,
                input_digest = excluded.input_digest,
                updated_at = excluded.updated_at",
            (
                pupil_id,
                subject_id,
                period_id,
                class_id,
                state,
                simple,
                weighted,
                digest,
                self.stamp(),
            ),
        )?;
        Ok(true)
    }

    pub fn subject_averages_for_pupil(
        &self,
        pupil_id: &str,
        period_id: &str,
    ) -> EngineResult<Vec<(String, Option<AverageValues>)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT subject_id, state, simple_average, weighted_average
             FROM subject_averages
             WHERE pupil_id = ? AND period_id = ?
             ORDER BY subject_id",
        )?;
        let rows = stmt
            .query_map((pupil_id, period_id), |r| {
                let subject_id: String = r.get(0)?;
                let state: String = r.get(1)?;
                Ok((subject_id, values_from(&state, r.get(2)?, r.get(3)?)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn cohort_subjects(&self, class_id: &str, period_id: &str) -> EngineResult<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT DISTINCT subject_id FROM subject_averages
             WHERE class_id = ? AND period_id = ?
             ORDER BY subject_id",
        )?;
        let ids = stmt
            .query_map((class_id, period_id), |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn subject_cohort(
        &self,
        class_id: &str,
        period_id: &str,
        subject_id: &str,
    ) -> EngineResult<Vec<CohortRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT pupil_id, state, weighted_average,
                    rank, class_size, class_min, class_max, class_mean
             FROM subject_averages
             WHERE class_id = ? AND period_id = ? AND subject_id = ?
             ORDER BY pupil_id",
        )?;
        let rows = stmt
            .query_map((class_id, period_id, subject_id), cohort_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_subject_placement(
        &self,
        pupil_id: &str,
        subject_id: &str,
        period_id: &str,
        placement: Option<CohortPlacement>,
    ) -> EngineResult<()> {
        self.ensure_writable(period_id)?;
        let p = placement_columns(placement);
        self.conn.execute(
            "UPDATE subject_averages
             SET rank = ?, class_size = ?, class_min = ?, class_max = ?, class_mean = ?, updated_at = ?
             WHERE pupil_id = ? AND subject_id = ? AND period_id = ?",
            (p.0, p.1, p.2, p.3, p.4, self.stamp(), pupil_id, subject_id, period_id),
        )?;
        Ok(())
    }

    pub fn put_general_average(
        &self,
        pupil_id: &str,
        period_id: &str,
        class_id: &str,
        values: Option<AverageValues>,
        honors: Honors,
        digest: &str,
    ) -> EngineResult<bool> {
        self.ensure_writable(period_id)?;
        let (state, simple, weighted) = match values {
            Some(v) => (STATE_PRESENT, Some(dec_text(v.simple)), Some(dec_text(v.weighted))),
            None => (STATE_ABSENT, None, None),
        };
        let existing: Option<(String, String, Option<String>, Option<String>, String, String)> = self
            .conn
            .query_row(
                "SELECT class_id, state, simple_average, weighted_average, honors, input_digest
                 FROM general_averages WHERE pupil_id = ? AND period_id = ?",
                (pupil_id, period_id),
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
            )
            .optional()?;
        if let Some((c, s, si, w, h, d)) = existing {
            if c == class_id
                && s == state
                && si == simple
                && w == weighted
                && h == honors.as_str()
                && d == digest
            {
                return Ok(false);
            }
        }
        self.conn.execute(
            "INSERT INTO general_averages(
                pupil_id, period_id, class_id, state, simple_average, weighted_average,
                rank, class_size, class_min, class_max, class_mean,
                honors, input_digest, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, NULL, NULL, NULL, NULL, NULL, ?, ?, ?)
             ON CONFLICT(pupil_id, period_id) DO UPDATE SET
                class_id = excluded.class_id,
                state = excluded.state,
                simple_average = excluded.simple_average,
                weighted_average = excluded.weighted_average,
                rank = NULL, class_size = NULL, class_min = NULL, class_max = NULL, class_mean = NULL,
                honors = excluded.honors,
                input_digest = excluded.input_digest,
                updated_at = excluded.updated_at",
            (
                pupil_id,
                period_id,
                class_id,
                state,
                simple,
                weighted,
                honors.as_str(),
                digest,
                self.stamp(),
            ),
        )?;
        Ok(true)
    }

    pub fn general_cohort(&self, class_id: &str, period_id: &str) -> EngineResult<Vec<CohortRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT pupil_id, state, weighted_average,
                    rank, class_size, class_min, class_max, class_mean
             FROM general_averages
             WHERE class_id = ? AND period_id = ?
             ORDER BY pupil_id",
        )?;
        let rows = stmt
            .query_map((class_id, period_id), cohort_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn general_average(
        &self,
        pupil_id: &str,
        period_id: &str,
    ) -> EngineResult<Option<Option<AverageValues>>> {
        Ok(self
            .conn
            .query_row(
                "SELECT state, simple_average, weighted_average
                 FROM general_averages WHERE pupil_id = ? AND period_id = ?",
                (pupil_id, period_id),
                |r| {
                    let state: String = r.get(0)?;
                    Ok(values_from(&state, r.get(1)?, r.get(2)?))
                },
            )
            .optional()?)
    }

    pub fn set_general_placement(
        &self,
        pupil_id: &str,
        period_id: &str,
        placement: Option<CohortPlacement>,
    ) -> EngineResult<()> {
        self.ensure_writable(period_id)?;
        let p = placement_columns(placement);
        self.conn.execute(
            "UPDATE general_averages
             SET rank = ?, class_size = ?, class_min = ?, class_max = ?, class_mean = ?, updated_at = ?
             WHERE pupil_id = ? AND period_id = ?",
            (p.0, p.1, p.2, p.3, p.4, self.stamp(), pupil_id, period_id),
        )?;
        Ok(())
    }

    /// `None` marks the finding absent; nothing is written when no finding ever existed.
    pub fn put_risk_finding(
        &self,
        pupil_id: &str,
        period_id: &str,
        class_id: &str,
        finding: Option<&RiskFinding>,
        digest: &str,
    ) -> EngineResult<bool> {
        self.ensure_writable(period_id)?;
        let existing: Option<(String, String, Option<String>, Option<String>, String, String)> = self
            .conn
            .query_row(
                "SELECT class_id, state, general_simple, general_weighted, weak_subjects_json, input_digest
                 FROM risk_findings WHERE pupil_id = ? AND period_id = ?",
                (pupil_id, period_id),
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
            )
            .optional()?;
        if finding.is_none() && existing.is_none() {
            return Ok(false);
        }
        let (state, simple, weighted, weak_json) = match finding {
            Some(f) => (
                STATE_PRESENT,
                Some(dec_text(f.general.simple)),
                Some(dec_text(f.general.weighted)),
                serde_json::to_string(&f.weak_subjects)
                    .map_err(|e| EngineError::Permanent(e.to_string()))?,
            ),
            None => (STATE_ABSENT, None, None, "[]".to_string()),
        };
        if let Some((c, s, si, w, j, d)) = existing {
            if c == class_id && s == state && si == simple && w == weighted && j == weak_json && d == digest {
                return Ok(false);
            }
        }
        self.conn.execute(
            "INSERT INTO risk_findings(
                pupil_id, period_id, class_id, state, general_simple, general_weighted,
                weak_subjects_json, input_digest, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(pupil_id, period_id) DO UPDATE SET
                class_id = excluded.class_id,
                state = excluded.state,
                general_simple = excluded.general_simple,
                general_weighted = excluded.general_weighted,
                weak_subjects_json = excluded.weak_subjects_json,
                input_digest = excluded.input_digest,
                updated_at = excluded.updated_at",
            (
                pupil_id,
                period_id,
                class_id,
                state,
                simple,
                weighted,
                weak_json,
                digest,
                self.stamp(),
            ),
        )?;
        Ok(true)
    }

    pub fn find_live_alert(&self, pupil_id: &str, c: &CandidateAlert) -> EngineResult<Option<Alert>> {
        let alert = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM alerts
                     WHERE pupil_id = ? AND kind = ? AND window_start = ? AND window_end = ?
                       AND state IN ('OPEN', 'ACKNOWLEDGED')",
                    ALERT_COLUMNS
                ),
                (
                    pupil_id,
                    c.kind.key(),
                    c.window_start.to_string(),
                    c.window_end.to_string(),
                ),
                alert_row,
            )
            .optional()?;
        alert.transpose()
    }

    /// Opens a fresh alert unless a live one (OPEN or ACKNOWLEDGED) already holds the key.
    pub fn open_alert(&self, pupil_id: &str, c: &CandidateAlert) -> EngineResult<OpenOutcome> {
        if c.observed_value < c.threshold {
            return Err(EngineError::Permanent(format!(
                "candidate {} below threshold ({} < {})",
                c.kind.key(),
                c.observed_value,
                c.threshold
            )));
        }
        if let Some(alert) = self.find_live_alert(pupil_id, c)? {
            return Ok(OpenOutcome {
                inserted: false,
                alert,
            });
        }
        let id = Uuid::new_v4().to_string();
        let created_at = self.stamp();
        self.conn.execute(
            "INSERT INTO alerts(
                id, pupil_id, kind, window_start, window_end, threshold, observed_value,
                detail_json, state, created_at, acknowledged_at, resolved_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'OPEN', ?, NULL, NULL)",
            (
                &id,
                pupil_id,
                c.kind.key(),
                c.window_start.to_string(),
                c.window_end.to_string(),
                c.threshold,
                c.observed_value,
                c.detail.to_string(),
                &created_at,
            ),
        )?;
        let seq = self.conn.last_insert_rowid();
        self.log_transition(&id, None, AlertState::Open, &created_at)?;
        Ok(OpenOutcome {
            inserted: true,
            alert: Alert {
                seq,
                id,
                pupil_id: pupil_id.to_string(),
                kind: c.kind,
                window_start: c.window_start,
                window_end: c.window_end,
                threshold: c.threshold,
                observed_value: c.observed_value,
                detail: c.detail.clone(),
                state: AlertState::Open,
                created_at,
                acknowledged_at: None,
                resolved_at: None,
            },
        })
    }

    pub fn get_alert(&self, alert_id: &str) -> EngineResult<Option<Alert>> {
        let alert = self
            .conn
            .query_row(
                &format!("SELECT {} FROM alerts WHERE id = ?", ALERT_COLUMNS),
                [alert_id],
                alert_row,
            )
            .optional()?;
        alert.transpose()
    }

    pub fn transition_alert(
        &self,
        alert_id: &str,
        next: AlertState,
        at: DateTime<Utc>,
    ) -> EngineResult<Alert> {
        let Some(mut alert) = self.get_alert(alert_id)? else {
            return Err(EngineError::missing("alert", alert_id));
        };
        if !alert.state.can_transition_to(next) {
            return Err(EngineError::Permanent(format!(
                "alert {} cannot move from {} to {}",
                alert_id,
                alert.state.as_str(),
                next.as_str()
            )));
        }
        let at = timestamp(at);
        let column = match next {
            AlertState::Acknowledged => "acknowledged_at",
            AlertState::Resolved => "resolved_at",
            AlertState::Open => "created_at",
        };
        self.conn.execute(
            &format!("UPDATE alerts SET state = ?, {} = ? WHERE id = ?", column),
            (next.as_str(), &at, alert_id),
        )?;
        self.log_transition(alert_id, Some(alert.state), next, &at)?;
        match next {
            AlertState::Acknowledged => alert.acknowledged_at = Some(at),
            AlertState::Resolved => alert.resolved_at = Some(at),
            AlertState::Open => {}
        }
        alert.state = next;
        Ok(alert)
    }

    fn log_transition(
        &self,
        alert_id: &str,
        from: Option<AlertState>,
        to: AlertState,
        at: &str,
    ) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO alert_transitions(alert_id, from_state, to_state, at) VALUES(?, ?, ?, ?)",
            (alert_id, from.map(|s| s.as_str()), to.as_str(), at),
        )?;
        Ok(())
    }
}

pub(crate) const ALERT_COLUMNS: &str = "seq, id, pupil_id, kind, window_start, window_end, threshold, \
     observed_value, detail_json, state, created_at, acknowledged_at, resolved_at";

/// Maps a row selected with [`ALERT_COLUMNS`]. Domain decoding errors land in the inner result.
pub(crate) fn alert_row(r: &Row<'_>) -> rusqlite::Result<EngineResult<Alert>> {
    let kind_raw: String = r.get(3)?;
    let start_raw: String = r.get(4)?;
    let end_raw: String = r.get(5)?;
    let detail_raw: String = r.get(8)?;
    let state_raw: String = r.get(9)?;
    let seq: i64 = r.get(0)?;
    let id: String = r.get(1)?;
    let pupil_id: String = r.get(2)?;
    let threshold: i64 = r.get(6)?;
    let observed_value: i64 = r.get(7)?;
    let created_at: String = r.get(10)?;
    let acknowledged_at: Option<String> = r.get(11)?;
    let resolved_at: Option<String> = r.get(12)?;
    Ok((|| -> EngineResult<Alert> {
        let kind = AlertKind::parse_key(&kind_raw)
            .ok_or_else(|| EngineError::Permanent(format!("unknown alert kind: {}", kind_raw)))?;
        let state = AlertState::parse(&state_raw)
            .ok_or_else(|| EngineError::Permanent(format!("unknown alert state: {}", state_raw)))?;
        Ok(Alert {
            seq,
            id,
            pupil_id,
            kind,
            window_start: crate::event_store::parse_date(&start_raw)?,
            window_end: crate::event_store::parse_date(&end_raw)?,
            threshold,
            observed_value,
            detail: serde_json::from_str(&detail_raw).unwrap_or(serde_json::Value::Null),
            state,
            created_at,
            acknowledged_at,
            resolved_at,
        })
    })())
}

fn cohort_row(r: &Row<'_>) -> rusqlite::Result<CohortRow> {
    let state: String = r.get(1)?;
    let weighted: Option<String> = r.get(2)?;
    Ok(CohortRow {
        pupil_id: r.get(0)?,
        weighted: if state == STATE_PRESENT { opt_dec(weighted) } else { None },
        placement: placement_from(r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?, r.get(7)?),
    })
}

type PlacementColumns = (
    Option<i64>,
    Option<i64>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn placement_columns(p: Option<CohortPlacement>) -> PlacementColumns {
    match p {
        Some(p) => (
            Some(p.rank),
            Some(p.class_size),
            Some(dec_text(p.class_min)),
            Some(dec_text(p.class_max)),
            Some(dec_text(p.class_mean)),
        ),
        None => (None, None, None, None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::event_store::fixtures;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 20, 15, 0, 0).single().expect("now")
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    fn candidate(observed: i64) -> CandidateAlert {
        CandidateAlert {
            kind: AlertKind::AbsenceCount,
            window_start: d("2025-02-19"),
            window_end: d("2025-03-20"),
            threshold: 5,
            observed_value: observed,
            detail: json!({ "scheduledSessions": 40 }),
        }
    }

    fn values(simple: i64, weighted: i64) -> Option<AverageValues> {
        Some(AverageValues {
            simple: Decimal::from(simple),
            weighted: Decimal::from(weighted),
        })
    }

    #[test]
    fn open_alert_is_idempotent_per_live_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");
        let store = AggregateStore::new(&conn, now());

        let first = store.open_alert("P1", &candidate(5)).expect("open");
        assert!(first.inserted);
        let again = store.open_alert("P1", &candidate(6)).expect("reopen");
        assert!(!again.inserted);
        assert_eq!(again.alert.id, first.alert.id);
        assert_eq!(again.alert.observed_value, 5);

        store
            .transition_alert(&first.alert.id, AlertState::Acknowledged, now())
            .expect("ack");
        assert!(!store.open_alert("P1", &candidate(5)).expect("acked").inserted);

        store
            .transition_alert(&first.alert.id, AlertState::Resolved, now())
            .expect("resolve");
        let fresh = store.open_alert("P1", &candidate(5)).expect("fresh");
        assert!(fresh.inserted);
        assert_ne!(fresh.alert.id, first.alert.id);
        assert!(fresh.alert.seq > first.alert.seq);
    }

    #[test]
    fn resolved_alerts_never_transition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");
        let store = AggregateStore::new(&conn, now());
        let a = store.open_alert("P1", &candidate(5)).expect("open").alert;
        store
            .transition_alert(&a.id, AlertState::Resolved, now())
            .expect("resolve");
        for next in [AlertState::Open, AlertState::Acknowledged, AlertState::Resolved] {
            assert!(store.transition_alert(&a.id, next, now()).is_err());
        }
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM alert_transitions WHERE alert_id = ?",
                [&a.id],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(n, 2);
    }

    #[test]
    fn below_threshold_candidates_are_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");
        let store = AggregateStore::new(&conn, now());
        assert!(store.open_alert("P1", &candidate(4)).is_err());
    }

    #[test]
    fn unchanged_subject_average_is_not_rewritten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");
        fixtures::period(&conn, "T1", "2025-01-06", "2025-03-28");

        let store = AggregateStore::new(&conn, now());
        assert!(store
            .put_subject_average("P1", "M", "T1", "C1", values(12, 11), "d1")
            .expect("put"));
        let later = AggregateStore::new(&conn, now() + chrono::Duration::hours(1));
        assert!(!later
            .put_subject_average("P1", "M", "T1", "C1", values(12, 11), "d1")
            .expect("put"));
        let stamp: String = conn
            .query_row("SELECT updated_at FROM subject_averages", [], |r| r.get(0))
            .expect("stamp");
        assert_eq!(stamp, timestamp(now()));

        assert!(later
            .put_subject_average("P1", "M", "T1", "C1", None, "d2")
            .expect("absent"));
        let rows = later.subject_averages_for_pupil("P1", "T1").expect("rows");
        assert_eq!(rows, vec![("M".to_string(), None)]);
    }

    #[test]
    fn locked_period_rejects_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");
        fixtures::period(&conn, "T1", "2025-01-06", "2025-03-28");
        conn.execute("UPDATE periods SET grades_locked = 1 WHERE id = 'T1'", [])
            .expect("lock");
        let store = AggregateStore::new(&conn, now());
        let e = store
            .put_general_average("P1", "T1", "C1", values(12, 12), Honors::Encouragements, "d")
            .expect_err("locked");
        assert!(matches!(e, EngineError::LockedPeriod { .. }));
        let e = store
            .put_subject_average("P1", "M", "T1", "C1", None, "d")
            .expect_err("locked");
        assert!(matches!(e, EngineError::LockedPeriod { .. }));
    }

    #[test]
    fn absent_risk_finding_needs_a_prior_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");
        fixtures::period(&conn, "T1", "2025-01-06", "2025-03-28");
        let store = AggregateStore::new(&conn, now());
        assert!(!store
            .put_risk_finding("P1", "T1", "C1", None, "d")
            .expect("noop"));
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM risk_findings", [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 0);
    }

    #[test]
    fn digest_depends_on_part_boundaries() {
        assert_ne!(input_digest(["ab", "c"]), input_digest(["a", "bc"]));
        assert_eq!(input_digest(["x"]).len(), 64);
    }
}
