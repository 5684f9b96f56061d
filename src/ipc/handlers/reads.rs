use crate::error::ErrorKind;
use crate::ipc::helpers::{get_opt_i64, get_opt_str, get_required_str, require_db, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::AlertState;
use crate::read_model::{self, Scope};
use crate::store::AggregateStore;
use chrono::Utc;
use serde_json::{json, Value};

fn scope(params: &Value) -> Result<Scope<'_>, HandlerErr> {
    Ok(Scope {
        pupil_id: get_opt_str(params, "pupilId")?,
        class_id: get_opt_str(params, "classId")?,
        period_id: get_opt_str(params, "periodId")?,
    })
}

fn parse_state(params: &Value) -> Result<Option<AlertState>, HandlerErr> {
    get_opt_str(params, "state")?
        .map(|raw| {
            AlertState::parse(raw)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown alert state: {}", raw)))
        })
        .transpose()
}

fn handle_aggregates_subject(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let subject_id = get_opt_str(&req.params, "subjectId")?;
    let rows = read_model::subject_averages(conn, &scope(&req.params)?, subject_id)?;
    Ok(json!({
        "averages": rows.iter().map(read_model::subject_average_json).collect::<Vec<_>>()
    }))
}

fn handle_aggregates_general(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let rows = read_model::general_averages(conn, &scope(&req.params)?)?;
    Ok(json!({
        "averages": rows.iter().map(read_model::general_average_json).collect::<Vec<_>>()
    }))
}

fn handle_risk_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    Ok(json!({ "findings": read_model::risk_findings(conn, &scope(&req.params)?)? }))
}

fn handle_alerts_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let pupil_id = get_opt_str(&req.params, "pupilId")?;
    let alerts = read_model::alerts(conn, pupil_id, parse_state(&req.params)?)?;
    Ok(json!({ "alerts": alerts.iter().map(|a| a.to_json()).collect::<Vec<_>>() }))
}

fn handle_alerts_history(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let alert_id = get_required_str(&req.params, "alertId")?;
    let store = AggregateStore::new(conn, Utc::now());
    let Some(alert) = store.get_alert(&alert_id)? else {
        return Err(HandlerErr::new("not_found", format!("alert not found: {}", alert_id)));
    };
    Ok(json!({
        "alert": alert.to_json(),
        "transitions": read_model::alert_history(conn, &alert_id)?,
    }))
}

fn handle_alerts_transition(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let alert_id = get_required_str(&req.params, "alertId")?;
    let raw = get_required_str(&req.params, "state")?;
    let next = AlertState::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown alert state: {}", raw)))?;
    let now = state.engine.as_ref().map(|e| e.now()).unwrap_or_else(Utc::now);

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let store = AggregateStore::new(&tx, now);
    if store.get_alert(&alert_id)?.is_none() {
        return Err(HandlerErr::new("not_found", format!("alert not found: {}", alert_id)));
    }
    let alert = store
        .transition_alert(&alert_id, next, now)
        .map_err(|e| match e.kind() {
            ErrorKind::Permanent => HandlerErr::new("invalid_transition", e.to_string()),
            _ => HandlerErr::from(e),
        })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    tracing::info!(alert_id = %alert_id, state = next.as_str(), "alert transitioned");
    Ok(json!({ "alert": alert.to_json() }))
}

fn handle_operator_issues(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let limit = get_opt_i64(&req.params, "limit")?.unwrap_or(100).clamp(1, 1000);
    Ok(json!({ "issues": read_model::operator_issues(conn, limit)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "aggregates.subject" => handle_aggregates_subject(state, req),
        "aggregates.general" => handle_aggregates_general(state, req),
        "risk.list" => handle_risk_list(state, req),
        "alerts.list" => handle_alerts_list(state, req),
        "alerts.history" => handle_alerts_history(state, req),
        "alerts.transition" => handle_alerts_transition(state, req),
        "operator.issues" => handle_operator_issues(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
