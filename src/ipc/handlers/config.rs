use crate::config;
use crate::ipc::helpers::{require_db, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::Value;

fn config_json(cfg: &config::EngineConfig) -> Result<Value, HandlerErr> {
    serde_json::to_value(cfg).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn handle_config_get(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    let engine = state
        .engine
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    config_json(&engine.config())
}

fn handle_config_update(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing params.patch object"));
    };
    let conn = require_db(state)?;
    let Some(engine) = state.engine.as_ref() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    let next = engine.config().merged(patch).map_err(|msg| HandlerErr {
        code: "bad_params",
        message: msg,
        details: Some(Value::Object(patch.clone())),
    })?;
    config::save(conn, &next).map_err(|e| HandlerErr::new("db_update_failed", format!("{e:?}")))?;

    let Some(engine) = state.engine.as_mut() else {
        return Err(HandlerErr::new("no_workspace", "select a workspace first"));
    };
    engine
        .apply_config(next.clone())
        .map_err(|e| HandlerErr::new("bad_params", format!("{e:#}")))?;
    tracing::info!(keys = ?patch.keys().collect::<Vec<_>>(), "engine config updated");
    config_json(&next)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "config.get" => handle_config_get(state, req),
        "config.update" => handle_config_update(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
