//! The platform-owned write path: source records are upserted here and only
//! read by work units. Integrity problems (score above maximum, overlapping
//! enrollments, non-positive coefficients) are accepted and surface during
//! recomputation.

use crate::event_store::parse_status;
use crate::ipc::helpers::{
    get_decimal, get_opt_bool, get_opt_i64, get_opt_str, get_required_str, parse_date,
    required_decimal, require_db, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::store::timestamp;
use chrono::Utc;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

fn records<'a>(params: &'a Value, key: &str) -> Result<&'a [Value], HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(&[][..]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be an array", key))),
    }
}

fn at(key: &str, index: usize, e: HandlerErr) -> HandlerErr {
    HandlerErr {
        code: e.code,
        message: format!("{}[{}]: {}", key, index, e.message),
        details: e.details,
    }
}

fn date_param(rec: &Value, key: &str) -> Result<String, HandlerErr> {
    Ok(parse_date(&get_required_str(rec, key)?, key)?.to_string())
}

fn opt_date_param(rec: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    get_opt_str(rec, key)?
        .map(|raw| parse_date(raw, key).map(|d| d.to_string()))
        .transpose()
}

fn dec_text(rec: &Value, key: &str) -> Result<String, HandlerErr> {
    Ok(required_decimal(rec, key)?.normalize().to_string())
}

fn flag(rec: &Value, key: &str, default: bool) -> Result<i64, HandlerErr> {
    Ok(i64::from(get_opt_bool(rec, key)?.unwrap_or(default)))
}

fn upsert_pupil(conn: &Connection, rec: &Value) -> Result<(), HandlerErr> {
    let id = get_required_str(rec, "id")?;
    let name = get_opt_str(rec, "displayName")?.unwrap_or(&id).to_string();
    conn.execute(
        "INSERT INTO pupils(id, display_name, version) VALUES(?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name, version = excluded.version",
        (&id, name, get_opt_i64(rec, "version")?.unwrap_or(0)),
    )?;
    Ok(())
}

fn upsert_class(conn: &Connection, rec: &Value) -> Result<(), HandlerErr> {
    let id = get_required_str(rec, "id")?;
    let name = get_opt_str(rec, "name")?.unwrap_or(&id).to_string();
    conn.execute(
        "INSERT INTO classes(id, name, version) VALUES(?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, version = excluded.version",
        (&id, name, get_opt_i64(rec, "version")?.unwrap_or(0)),
    )?;
    Ok(())
}

fn upsert_year(conn: &Connection, rec: &Value) -> Result<(), HandlerErr> {
    let id = get_required_str(rec, "id")?;
    let label = get_opt_str(rec, "label")?.unwrap_or(&id).to_string();
    conn.execute(
        "INSERT INTO academic_years(id, label, start_date, end_date) VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           label = excluded.label, start_date = excluded.start_date, end_date = excluded.end_date",
        (&id, label, date_param(rec, "startDate")?, date_param(rec, "endDate")?),
    )?;
    Ok(())
}

fn upsert_period(conn: &Connection, rec: &Value) -> Result<(), HandlerErr> {
    let id = get_required_str(rec, "id")?;
    let start = date_param(rec, "startDate")?;
    let end = date_param(rec, "endDate")?;
    if end < start {
        return Err(HandlerErr::bad_params("endDate precedes startDate"));
    }
    let number = get_opt_i64(rec, "number")?.ok_or_else(|| HandlerErr::bad_params("missing number"))?;
    // Lock state is owned by period.lock / period.unlock unless the record carries it.
    let locked = get_opt_bool(rec, "gradesLocked")?.map(i64::from);
    conn.execute(
        "INSERT INTO periods(id, year_id, number, start_date, end_date, grades_locked, version)
         VALUES(?1, ?2, ?3, ?4, ?5, COALESCE(?6, 0), ?7)
         ON CONFLICT(id) DO UPDATE SET
           year_id = excluded.year_id,
           number = excluded.number,
           start_date = excluded.start_date,
           end_date = excluded.end_date,
           grades_locked = COALESCE(?6, periods.grades_locked),
           version = excluded.version",
        (
            &id,
            get_required_str(rec, "yearId")?,
            number,
            start,
            end,
            locked,
            get_opt_i64(rec, "version")?.unwrap_or(0),
        ),
    )?;
    Ok(())
}

fn upsert_subject(conn: &Connection, rec: &Value) -> Result<(), HandlerErr> {
    let id = get_required_str(rec, "id")?;
    let short = get_opt_str(rec, "shortName")?.unwrap_or(&id).to_string();
    conn.execute(
        "INSERT INTO subjects(id, short_name, coefficient, version) VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           short_name = excluded.short_name, coefficient = excluded.coefficient, version = excluded.version",
        (
            &id,
            short,
            dec_text(rec, "coefficient")?,
            get_opt_i64(rec, "version")?.unwrap_or(0),
        ),
    )?;
    Ok(())
}

fn upsert_enrollment(conn: &Connection, rec: &Value) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO enrollments(id, pupil_id, class_id, active, start_date, end_date, version)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           pupil_id = excluded.pupil_id,
           class_id = excluded.class_id,
           active = excluded.active,
           start_date = excluded.start_date,
           end_date = excluded.end_date,
           version = excluded.version",
        (
            get_required_str(rec, "id")?,
            get_required_str(rec, "pupilId")?,
            get_required_str(rec, "classId")?,
            flag(rec, "active", true)?,
            date_param(rec, "startDate")?,
            opt_date_param(rec, "endDate")?,
            get_opt_i64(rec, "version")?.unwrap_or(0),
        ),
    )?;
    Ok(())
}

fn upsert_session(conn: &Connection, rec: &Value) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO scheduled_sessions(id, class_id, date, duration_minutes) VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           class_id = excluded.class_id, date = excluded.date, duration_minutes = excluded.duration_minutes",
        (
            get_required_str(rec, "id")?,
            get_required_str(rec, "classId")?,
            date_param(rec, "date")?,
            get_opt_i64(rec, "durationMinutes")?.unwrap_or(60),
        ),
    )?;
    Ok(())
}

fn upsert_attendance(conn: &Connection, rec: &Value) -> Result<(), HandlerErr> {
    let raw_status = get_required_str(rec, "status")?;
    let status = parse_status(&raw_status)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", raw_status)))?;
    let late = get_opt_i64(rec, "lateMinutes")?.unwrap_or(0);
    if late < 0 {
        return Err(HandlerErr::bad_params("lateMinutes must not be negative"));
    }
    conn.execute(
        "INSERT INTO attendance(pupil_id, session_id, date, status, justified, late_minutes, version)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(pupil_id, session_id, date) DO UPDATE SET
           status = excluded.status,
           justified = excluded.justified,
           late_minutes = excluded.late_minutes,
           version = excluded.version",
        (
            get_required_str(rec, "pupilId")?,
            get_required_str(rec, "sessionId")?,
            date_param(rec, "date")?,
            status.as_str(),
            flag(rec, "justified", false)?,
            late,
            get_opt_i64(rec, "version")?.unwrap_or(0),
        ),
    )?;
    Ok(())
}

fn upsert_evaluation(conn: &Connection, rec: &Value) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO evaluations(id, subject_id, class_id, teacher_id, period_id, date,
                                 max_score, coefficient, counts_in_average, published, version)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           subject_id = excluded.subject_id,
           class_id = excluded.class_id,
           teacher_id = excluded.teacher_id,
           period_id = excluded.period_id,
           date = excluded.date,
           max_score = excluded.max_score,
           coefficient = excluded.coefficient,
           counts_in_average = excluded.counts_in_average,
           published = excluded.published,
           version = excluded.version",
        (
            get_required_str(rec, "id")?,
            get_required_str(rec, "subjectId")?,
            get_required_str(rec, "classId")?,
            get_opt_str(rec, "teacherId")?,
            get_required_str(rec, "periodId")?,
            date_param(rec, "date")?,
            dec_text(rec, "maxScore")?,
            dec_text(rec, "coefficient")?,
            flag(rec, "countsInAverage", true)?,
            flag(rec, "published", false)?,
            get_opt_i64(rec, "version")?.unwrap_or(0),
        ),
    )?;
    Ok(())
}

fn upsert_grade(conn: &Connection, rec: &Value) -> Result<(), HandlerErr> {
    let score = get_decimal(rec, "score")?.map(|d| d.normalize().to_string());
    conn.execute(
        "INSERT INTO grades(evaluation_id, pupil_id, score, absent, cheating, excused, version)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(evaluation_id, pupil_id) DO UPDATE SET
           score = excluded.score,
           absent = excluded.absent,
           cheating = excluded.cheating,
           excused = excluded.excused,
           version = excluded.version",
        (
            get_required_str(rec, "evaluationId")?,
            get_required_str(rec, "pupilId")?,
            score,
            flag(rec, "absent", false)?,
            flag(rec, "cheating", false)?,
            flag(rec, "excused", false)?,
            get_opt_i64(rec, "version")?.unwrap_or(0),
        ),
    )?;
    Ok(())
}

fn delete_attendance(conn: &Connection, rec: &Value) -> Result<(), HandlerErr> {
    conn.execute(
        "DELETE FROM attendance WHERE pupil_id = ? AND session_id = ? AND date = ?",
        (
            get_required_str(rec, "pupilId")?,
            get_required_str(rec, "sessionId")?,
            date_param(rec, "date")?,
        ),
    )?;
    Ok(())
}

fn delete_grade(conn: &Connection, rec: &Value) -> Result<(), HandlerErr> {
    conn.execute(
        "DELETE FROM grades WHERE evaluation_id = ? AND pupil_id = ?",
        (
            get_required_str(rec, "evaluationId")?,
            get_required_str(rec, "pupilId")?,
        ),
    )?;
    Ok(())
}

type Apply = fn(&Connection, &Value) -> Result<(), HandlerErr>;

// Parents before children so a single payload can carry a whole term.
const SECTIONS: &[(&str, Apply)] = &[
    ("pupils", upsert_pupil),
    ("classes", upsert_class),
    ("years", upsert_year),
    ("periods", upsert_period),
    ("subjects", upsert_subject),
    ("enrollments", upsert_enrollment),
    ("sessions", upsert_session),
    ("attendance", upsert_attendance),
    ("evaluations", upsert_evaluation),
    ("grades", upsert_grade),
    ("deleteAttendance", delete_attendance),
    ("deleteGrades", delete_grade),
];

fn source_apply(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    if let Some(obj) = params.as_object() {
        if let Some(unknown) = obj
            .keys()
            .find(|k| !SECTIONS.iter().any(|(name, _)| *name == k.as_str()))
        {
            return Err(HandlerErr::bad_params(format!("unknown section: {}", unknown)));
        }
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut counts = Map::new();
    for (name, apply) in SECTIONS {
        let items = records(params, name)?;
        for (i, rec) in items.iter().enumerate() {
            apply(&tx, rec).map_err(|e| at(name, i, e))?;
        }
        if !items.is_empty() {
            counts.insert(name.to_string(), json!(items.len()));
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "applied": counts }))
}

fn set_period_lock(state: &AppState, req: &Request, locked: bool) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let period_id = get_required_str(&req.params, "periodId")?;
    let now = state.engine.as_ref().map(|e| e.now()).unwrap_or_else(Utc::now);
    let changed = conn.execute(
        "UPDATE periods SET grades_locked = ?, locked_at = ? WHERE id = ?",
        (
            i64::from(locked),
            locked.then(|| timestamp(now)),
            &period_id,
        ),
    )?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", format!("period not found: {}", period_id)));
    }
    tracing::info!(period_id = %period_id, locked, "period lock changed");
    Ok(json!({ "periodId": period_id, "locked": locked }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "source.apply" => require_db(state).and_then(|conn| source_apply(conn, &req.params)),
        "period.lock" => set_period_lock(state, req, true),
        "period.unlock" => set_period_lock(state, req, false),
        _ => return None,
    };
    Some(respond(req, result))
}
