//! Queries behind the dashboard-facing read methods. Values are rounded here,
//! on their way out.

use crate::error::EngineResult;
use crate::model::{
    round2, round2_opt, Alert, AlertState, AverageValues, CohortPlacement, GeneralAverage, Honors,
    SubjectAverage, WeakSubject,
};
use crate::store::{alert_row, placement_from, values_from, ALERT_COLUMNS, STATE_PRESENT};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};

/// Optional equality filters; `None` matches everything.
#[derive(Debug, Default, Clone)]
pub struct Scope<'a> {
    pub pupil_id: Option<&'a str>,
    pub class_id: Option<&'a str>,
    pub period_id: Option<&'a str>,
}

impl Scope<'_> {
    fn clause(&self, args: &mut Vec<SqlValue>) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for (column, value) in [
            ("pupil_id = ?", self.pupil_id),
            ("class_id = ?", self.class_id),
            ("period_id = ?", self.period_id),
        ] {
            if let Some(v) = value {
                parts.push(column);
                args.push(SqlValue::Text(v.to_string()));
            }
        }
        if parts.is_empty() {
            "1 = 1".to_string()
        } else {
            parts.join(" AND ")
        }
    }
}

fn values_json(values: Option<AverageValues>) -> Value {
    match values {
        Some(v) => json!({
            "state": "PRESENT",
            "simpleAverage": round2(v.simple),
            "weightedAverage": round2(v.weighted),
        }),
        None => json!({ "state": "ABSENT", "simpleAverage": null, "weightedAverage": null }),
    }
}

fn placement_json(p: Option<CohortPlacement>) -> Value {
    match p {
        Some(p) => json!({
            "rank": p.rank,
            "classSize": p.class_size,
            "classMin": round2(p.class_min),
            "classMax": round2(p.class_max),
            "classMean": round2(p.class_mean),
        }),
        None => Value::Null,
    }
}

pub fn subject_average_json(a: &SubjectAverage) -> Value {
    let mut v = values_json(a.values);
    v["pupilId"] = json!(a.pupil_id);
    v["subjectId"] = json!(a.subject_id);
    v["periodId"] = json!(a.period_id);
    v["classId"] = json!(a.class_id);
    v["placement"] = placement_json(a.placement);
    v["updatedAt"] = json!(a.updated_at);
    v
}

pub fn general_average_json(a: &GeneralAverage) -> Value {
    let mut v = values_json(a.values);
    v["pupilId"] = json!(a.pupil_id);
    v["periodId"] = json!(a.period_id);
    v["classId"] = json!(a.class_id);
    v["placement"] = placement_json(a.placement);
    v["honors"] = json!(a.honors.as_str());
    v["updatedAt"] = json!(a.updated_at);
    v
}

pub fn subject_averages(
    conn: &Connection,
    scope: &Scope<'_>,
    subject_id: Option<&str>,
) -> EngineResult<Vec<SubjectAverage>> {
    let mut args = Vec::new();
    let mut filter = scope.clause(&mut args);
    if let Some(s) = subject_id {
        filter.push_str(" AND subject_id = ?");
        args.push(SqlValue::Text(s.to_string()));
    }
    let sql = format!(
        "SELECT pupil_id, subject_id, period_id, class_id, state, simple_average, weighted_average,
                rank, class_size, class_min, class_max, class_mean, updated_at
         FROM subject_averages WHERE {}
         ORDER BY period_id, class_id, subject_id, pupil_id",
        filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), |r| {
            let state: String = r.get(4)?;
            Ok(SubjectAverage {
                pupil_id: r.get(0)?,
                subject_id: r.get(1)?,
                period_id: r.get(2)?,
                class_id: r.get(3)?,
                values: values_from(&state, r.get(5)?, r.get(6)?),
                placement: placement_from(r.get(7)?, r.get(8)?, r.get(9)?, r.get(10)?, r.get(11)?),
                updated_at: r.get(12)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn general_averages(conn: &Connection, scope: &Scope<'_>) -> EngineResult<Vec<GeneralAverage>> {
    let mut args = Vec::new();
    let filter = scope.clause(&mut args);
    let sql = format!(
        "SELECT pupil_id, period_id, class_id, state, simple_average, weighted_average,
                rank, class_size, class_min, class_max, class_mean, honors, updated_at
         FROM general_averages WHERE {}
         ORDER BY period_id, class_id, pupil_id",
        filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), |r| {
            let state: String = r.get(3)?;
            let honors: String = r.get(11)?;
            Ok(GeneralAverage {
                pupil_id: r.get(0)?,
                period_id: r.get(1)?,
                class_id: r.get(2)?,
                values: values_from(&state, r.get(4)?, r.get(5)?),
                placement: placement_from(r.get(6)?, r.get(7)?, r.get(8)?, r.get(9)?, r.get(10)?),
                honors: Honors::parse(&honors).unwrap_or(Honors::None),
                updated_at: r.get(12)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Present findings only; withdrawn ones stay stored as absent markers.
pub fn risk_findings(conn: &Connection, scope: &Scope<'_>) -> EngineResult<Vec<Value>> {
    let mut args = Vec::new();
    let filter = scope.clause(&mut args);
    let sql = format!(
        "SELECT pupil_id, period_id, class_id, general_simple, general_weighted,
                weak_subjects_json, updated_at
         FROM risk_findings WHERE state = '{}' AND {}
         ORDER BY period_id, class_id, pupil_id",
        STATE_PRESENT, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), |r| {
            let weak_raw: String = r.get(5)?;
            let weak: Vec<WeakSubject> = serde_json::from_str(&weak_raw).unwrap_or_default();
            let simple: Option<String> = r.get(3)?;
            let weighted: Option<String> = r.get(4)?;
            Ok(json!({
                "pupilId": r.get::<_, String>(0)?,
                "periodId": r.get::<_, String>(1)?,
                "classId": r.get::<_, String>(2)?,
                "generalSimple": round2_opt(simple.as_deref().and_then(crate::model::parse_decimal)),
                "generalWeighted": round2_opt(weighted.as_deref().and_then(crate::model::parse_decimal)),
                "weakSubjects": weak.iter().map(|w| json!({
                    "subjectId": w.subject_id,
                    "shortName": w.short_name,
                    "weightedAverage": round2(w.weighted_average),
                })).collect::<Vec<_>>(),
                "updatedAt": r.get::<_, String>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn alerts(conn: &Connection, pupil_id: Option<&str>, state: Option<AlertState>) -> EngineResult<Vec<Alert>> {
    let mut args: Vec<SqlValue> = Vec::new();
    let mut filter = String::from("1 = 1");
    if let Some(p) = pupil_id {
        filter.push_str(" AND pupil_id = ?");
        args.push(SqlValue::Text(p.to_string()));
    }
    if let Some(s) = state {
        filter.push_str(" AND state = ?");
        args.push(SqlValue::Text(s.as_str().to_string()));
    }
    let sql = format!(
        "SELECT {} FROM alerts WHERE {} ORDER BY seq",
        ALERT_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), alert_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().collect()
}

pub fn alert_history(conn: &Connection, alert_id: &str) -> EngineResult<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT from_state, to_state, at FROM alert_transitions
         WHERE alert_id = ? ORDER BY id",
    )?;
    let rows = stmt
        .query_map([alert_id], |r| {
            Ok(json!({
                "from": r.get::<_, Option<String>>(0)?,
                "to": r.get::<_, String>(1)?,
                "at": r.get::<_, String>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn operator_issues(conn: &Connection, limit: i64) -> EngineResult<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, unit_key, pupil_id, message, created_at
         FROM operator_issues ORDER BY created_at DESC, id LIMIT ?",
    )?;
    let rows = stmt
        .query_map([limit], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "kind": r.get::<_, String>(1)?,
                "unitKey": r.get::<_, String>(2)?,
                "pupilId": r.get::<_, Option<String>>(3)?,
                "message": r.get::<_, String>(4)?,
                "createdAt": r.get::<_, String>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn dead_letters(conn: &Connection, include_requeued: bool) -> EngineResult<Vec<Value>> {
    let sql = if include_requeued {
        "SELECT id, unit_key, unit_json, error_kind, error, attempts, parked_at, requeued_at
         FROM dead_letters ORDER BY parked_at, id"
    } else {
        "SELECT id, unit_key, unit_json, error_kind, error, attempts, parked_at, requeued_at
         FROM dead_letters WHERE requeued_at IS NULL ORDER BY parked_at, id"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |r| {
            let unit_raw: String = r.get(2)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "unitKey": r.get::<_, String>(1)?,
                "unit": serde_json::from_str::<Value>(&unit_raw).unwrap_or(Value::Null),
                "errorKind": r.get::<_, String>(3)?,
                "error": r.get::<_, String>(4)?,
                "attempts": r.get::<_, i64>(5)?,
                "parkedAt": r.get::<_, String>(6)?,
                "requeuedAt": r.get::<_, Option<String>>(7)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::store::AggregateStore;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[test]
    fn averages_are_rounded_only_on_the_way_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = db::open_db(dir.path()).expect("open");
        crate::event_store::fixtures::period(&conn, "T1", "2025-01-01", "2025-03-31");
        let store = AggregateStore::new(&conn, Utc::now());
        let values = AverageValues {
            simple: Decimal::from_str("13.333333333333333333").expect("dec"),
            weighted: Decimal::from_str("9.333333333333333333").expect("dec"),
        };
        store
            .put_subject_average("P", "M", "T1", "C", Some(values), "d")
            .expect("put");

        let rows = subject_averages(
            &conn,
            &Scope {
                class_id: Some("C"),
                ..Scope::default()
            },
            None,
        )
        .expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values, Some(values));
        let out = subject_average_json(&rows[0]);
        assert_eq!(out["simpleAverage"], json!(13.33));
        assert_eq!(out["weightedAverage"], json!(9.33));
        assert_eq!(out["placement"], Value::Null);

        let none = subject_averages(&conn, &Scope::default(), Some("FR")).expect("rows");
        assert!(none.is_empty());
    }
}
