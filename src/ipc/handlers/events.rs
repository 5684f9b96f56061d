use crate::engine::Engine;
use crate::event_store::Snapshot;
use crate::ipc::helpers::{
    get_opt_i64, get_opt_str, get_required_str, offer_name, parse_instant, require_db,
    require_engine, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::store::timestamp;
use crate::unit::WorkKey;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Topic {
    Attendance,
    Grades,
}

fn topic_of(kind: &str) -> Option<Topic> {
    let family = kind.split('.').next().unwrap_or_default();
    match family {
        "attendance" => Some(Topic::Attendance),
        "grade" | "evaluation" => Some(Topic::Grades),
        _ => None,
    }
}

/// Map one inbound message onto the unit it triggers.
fn resolve_unit(conn: &Connection, event: &Value) -> Result<(WorkKey, String), HandlerErr> {
    let kind = get_required_str(event, "kind")?;
    let topic = topic_of(&kind).ok_or_else(|| HandlerErr::bad_params(format!("unknown event kind: {}", kind)))?;
    let pupil_id = get_opt_str(event, "pupilId")?;
    let class_id = get_opt_str(event, "classId")?;
    let period_id = get_opt_str(event, "periodId")?;
    let evaluation_id = get_opt_str(event, "evaluationId")?;

    match topic {
        Topic::Attendance => {
            let pupil = pupil_id.ok_or_else(|| HandlerErr::bad_params("attendance events need pupilId"))?;
            Ok((WorkKey::sweep(pupil), format!("{}:{}", kind, pupil)))
        }
        Topic::Grades => {
            let record_key = format!(
                "{}:{}:{}",
                kind,
                evaluation_id.or(class_id).unwrap_or_default(),
                pupil_id.unwrap_or_default()
            );
            if let (Some(c), Some(p)) = (class_id, period_id) {
                return Ok((WorkKey::recompute(c, p), record_key));
            }
            let snapshot = Snapshot::open(conn)?;
            if let Some(eval) = evaluation_id {
                let (c, p) = snapshot
                    .evaluation_scope(eval)?
                    .ok_or_else(|| HandlerErr::new("not_found", format!("evaluation not found: {}", eval)))?;
                return Ok((WorkKey::recompute(c, p), record_key));
            }
            if let (Some(pupil), Some(p)) = (pupil_id, period_id) {
                let period = snapshot
                    .get_period(p)?
                    .ok_or_else(|| HandlerErr::new("not_found", format!("period not found: {}", p)))?;
                let c = snapshot.class_of_pupil(pupil, &period)?.ok_or_else(|| {
                    HandlerErr::new("not_found", format!("no active enrollment for {} in {}", pupil, p))
                })?;
                return Ok((WorkKey::recompute(c, p), record_key));
            }
            Err(HandlerErr::bad_params(
                "grade events need classId+periodId, evaluationId, or pupilId+periodId",
            ))
        }
    }
}

/// Remember the highest version per record. Stale versions are still processed:
/// units always read the current committed state.
fn note_version(conn: &Connection, record_key: &str, version: i64, occurred_at: &str) -> Result<bool, HandlerErr> {
    let last: Option<i64> = conn
        .query_row(
            "SELECT version FROM event_versions WHERE record_key = ?",
            [record_key],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(last) = last {
        if version <= last {
            return Ok(false);
        }
    }
    conn.execute(
        "INSERT INTO event_versions(record_key, version, occurred_at) VALUES(?, ?, ?)
         ON CONFLICT(record_key) DO UPDATE SET
           version = excluded.version, occurred_at = excluded.occurred_at",
        (record_key, version, occurred_at),
    )?;
    Ok(true)
}

fn ingest_one(conn: &Connection, engine: &Engine, event: &Value) -> Result<Value, HandlerErr> {
    let (key, record_key) = resolve_unit(conn, event)?;
    let occurred_at = match get_opt_str(event, "occurredAt")? {
        Some(raw) => timestamp(parse_instant(raw, "occurredAt")?),
        None => timestamp(engine.now()),
    };
    let mut in_order = true;
    if let Some(version) = get_opt_i64(event, "version")? {
        in_order = note_version(conn, &record_key, version, &occurred_at)?;
        if !in_order {
            tracing::warn!(
                record = %record_key,
                version,
                "out-of-order event; processing against current state"
            );
        }
    }
    let offer = engine.enqueue_event(key.clone());
    Ok(json!({
        "unit": key.to_json(),
        "unitKey": key.to_string(),
        "offer": offer_name(offer),
        "inOrder": in_order,
    }))
}

fn handle_events_ingest(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let engine = require_engine(state)?;
    if let Some(event) = req.params.get("event") {
        return ingest_one(conn, engine, event);
    }
    let Some(events) = req.params.get("events").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing params.event or params.events"));
    };
    let mut results = Vec::with_capacity(events.len());
    let mut failed = 0usize;
    for (i, event) in events.iter().enumerate() {
        match ingest_one(conn, engine, event) {
            Ok(v) => results.push(v),
            Err(e) => {
                failed += 1;
                results.push(json!({
                    "index": i,
                    "error": { "code": e.code, "message": e.message },
                }));
            }
        }
    }
    Ok(json!({ "results": results, "failed": failed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "events.ingest" => handle_events_ingest(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
