use crate::engine::Engine;
use crate::error::{EngineError, ErrorKind};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::parse_decimal;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde_json::Value;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<EngineError> for HandlerErr {
    fn from(e: EngineError) -> Self {
        let code = match e.kind() {
            ErrorKind::Transient => "db_busy",
            ErrorKind::DataIntegrity => "data_integrity",
            ErrorKind::LockedPeriod => "locked_period",
            ErrorKind::Permanent => "db_query_failed",
            ErrorKind::Cancelled | ErrorKind::DeadlineExceeded => "cancelled",
        };
        HandlerErr::new(code, e.to_string())
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        HandlerErr::new("db_query_failed", e.to_string())
    }
}

pub fn respond(req: &Request, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn require_engine(state: &AppState) -> Result<&Engine, HandlerErr> {
    state
        .engine
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str<'a>(params: &'a Value, key: &str) -> Result<Option<&'a str>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_opt_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a boolean", key))),
    }
}

pub fn get_opt_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn parse_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn parse_instant(raw: &str, key: &str) -> Result<DateTime<Utc>, HandlerErr> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| HandlerErr::bad_params(format!("{} must be an RFC 3339 timestamp", key)))
}

/// Accepts a JSON number or a decimal string.
pub fn get_decimal(params: &Value, key: &str) -> Result<Option<Decimal>, HandlerErr> {
    let raw = match params.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => return Err(HandlerErr::bad_params(format!("{} must be a number", key))),
    };
    parse_decimal(&raw)
        .map(Some)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} is not a decimal: {}", key, raw)))
}

pub fn required_decimal(params: &Value, key: &str) -> Result<Decimal, HandlerErr> {
    get_decimal(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn offer_name(offer: crate::scheduler::Offer) -> &'static str {
    use crate::scheduler::Offer;
    match offer {
        Offer::Accepted => "accepted",
        Offer::Coalesced => "coalesced",
        Offer::RerunMarked => "rerunMarked",
        Offer::Full => "full",
    }
}
