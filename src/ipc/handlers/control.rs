use crate::ipc::helpers::{
    get_opt_bool, get_opt_i64, get_required_str, offer_name, require_db, require_engine, respond,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::read_model;
use crate::store::timestamp;
use crate::unit::WorkKey;
use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use std::time::Duration;

fn handle_sweep_run_daily(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    let engine = require_engine(state)?;
    let report = engine.run_daily_sweep()?;
    serde_json::to_value(report).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn enqueue(state: &AppState, key: WorkKey) -> Result<Value, HandlerErr> {
    let engine = require_engine(state)?;
    let offer = engine.enqueue_event(key.clone());
    Ok(json!({ "unitKey": key.to_string(), "offer": offer_name(offer) }))
}

fn handle_aggregates_recompute(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(&req.params, "classId")?;
    let period_id = get_required_str(&req.params, "periodId")?;
    enqueue(state, WorkKey::recompute(class_id, period_id))
}

fn handle_alerts_sweep(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let pupil_id = get_required_str(&req.params, "pupilId")?;
    enqueue(state, WorkKey::sweep(pupil_id))
}

fn handle_scheduler_drain(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let engine = require_engine(state)?;
    let timeout_ms = get_opt_i64(&req.params, "timeoutMs")?.unwrap_or(30_000).max(0);
    let idle = engine.drain(Duration::from_millis(timeout_ms as u64));
    Ok(json!({ "idle": idle, "status": engine.status() }))
}

fn handle_scheduler_status(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    let engine = require_engine(state)?;
    serde_json::to_value(engine.status()).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn handle_dead_letters_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let include = get_opt_bool(&req.params, "includeRequeued")?.unwrap_or(false);
    Ok(json!({ "deadLetters": read_model::dead_letters(conn, include)? }))
}

fn handle_dead_letters_requeue(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let engine = require_engine(state)?;
    let id = get_required_str(&req.params, "id")?;
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT unit_json, requeued_at FROM dead_letters WHERE id = ?",
            [&id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((unit_json, requeued_at)) = row else {
        return Err(HandlerErr::new("not_found", format!("dead letter not found: {}", id)));
    };
    if requeued_at.is_some() {
        return Err(HandlerErr::new("already_requeued", format!("dead letter {} was already requeued", id)));
    }
    let key: WorkKey = serde_json::from_str(&unit_json)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("stored unit unreadable: {}", e)))?;
    let offer = engine.enqueue_event(key.clone());
    conn.execute(
        "UPDATE dead_letters SET requeued_at = ? WHERE id = ?",
        (timestamp(engine.now()), &id),
    )?;
    tracing::info!(dead_letter = %id, unit = %key, "dead letter requeued");
    Ok(json!({ "unitKey": key.to_string(), "offer": offer_name(offer) }))
}

fn handle_publisher_replay(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    let engine = require_engine(state)?;
    Ok(json!({ "delivered": engine.replay()? }))
}

fn handle_publisher_peek(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    let engine = require_engine(state)?;
    Ok(json!({ "events": engine.published_events() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "sweep.runDaily" => handle_sweep_run_daily(state, req),
        "aggregates.recompute" => handle_aggregates_recompute(state, req),
        "alerts.sweep" => handle_alerts_sweep(state, req),
        "scheduler.drain" => handle_scheduler_drain(state, req),
        "scheduler.status" => handle_scheduler_status(state, req),
        "deadLetters.list" => handle_dead_letters_list(state, req),
        "deadLetters.requeue" => handle_dead_letters_requeue(state, req),
        "publisher.replay" => handle_publisher_replay(state, req),
        "publisher.peek" => handle_publisher_peek(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
