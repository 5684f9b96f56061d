use crate::config;
use crate::db;
use crate::engine::Engine;
use crate::ipc::helpers::{get_opt_str, get_required_str, parse_instant, require_engine, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::timestamp;
use serde_json::{json, Value};
use std::path::PathBuf;

fn handle_health(state: &mut AppState, _req: &Request) -> Result<Value, HandlerErr> {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
        "now": state.engine.as_ref().map(|e| timestamp(e.now())),
        "clockFixed": state.engine.as_ref().map(|e| e.is_clock_fixed()),
    }))
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let path = PathBuf::from(get_required_str(&req.params, "path")?);
    let fixed_now = get_opt_str(&req.params, "fixedNow")?
        .map(|raw| parse_instant(raw, "fixedNow"))
        .transpose()?;

    // One workspace at a time: the previous engine drains before the next opens.
    state.close();

    let conn = db::open_db(&path).map_err(|e| HandlerErr::new("db_open_failed", format!("{e:?}")))?;
    let cfg = config::load(&conn).map_err(|e| HandlerErr::new("db_query_failed", format!("{e:?}")))?;
    let engine = Engine::start(&path, cfg, fixed_now)
        .map_err(|e| HandlerErr::new("engine_start_failed", format!("{e:?}")))?;

    state.workspace = Some(path.clone());
    state.db = Some(conn);
    state.engine = Some(engine);
    Ok(json!({
        "workspacePath": path.to_string_lossy(),
        "clockFixed": fixed_now.is_some(),
    }))
}

fn handle_clock_set(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let engine = require_engine(state)?;
    let now = parse_instant(&get_required_str(&req.params, "now")?, "now")?;
    if !engine.set_clock(now) {
        return Err(HandlerErr::new(
            "clock_not_fixed",
            "the engine runs on host time; reopen the workspace with fixedNow",
        ));
    }
    Ok(json!({ "now": timestamp(engine.now()) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "health" => handle_health(state, req),
        "workspace.select" => handle_workspace_select(state, req),
        "clock.set" => handle_clock_set(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
