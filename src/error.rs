use rusqlite::ErrorCode;
use serde::Serialize;
use thiserror::Error;

/// How the scheduler treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    DataIntegrity,
    LockedPeriod,
    Permanent,
    Cancelled,
    DeadlineExceeded,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::DataIntegrity => "data_integrity",
            ErrorKind::LockedPeriod => "locked_period",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("data integrity violation for pupil {pupil_id}: {message}")]
    DataIntegrity { pupil_id: String, message: String },

    #[error("period {period_id} is locked")]
    LockedPeriod { period_id: String },

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("unit cancelled")]
    Cancelled,

    #[error("unit deadline exceeded")]
    DeadlineExceeded,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Transient(_) => ErrorKind::Transient,
            EngineError::DataIntegrity { .. } => ErrorKind::DataIntegrity,
            EngineError::LockedPeriod { .. } => ErrorKind::LockedPeriod,
            EngineError::Permanent(_) => ErrorKind::Permanent,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::DeadlineExceeded
        )
    }

    pub fn integrity(pupil_id: &str, message: impl Into<String>) -> Self {
        EngineError::DataIntegrity {
            pupil_id: pupil_id.to_string(),
            message: message.into(),
        }
    }

    pub fn missing(what: &str, id: &str) -> Self {
        EngineError::Permanent(format!("{} not found: {}", what, id))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy)
            | Some(ErrorCode::DatabaseLocked)
            | Some(ErrorCode::SystemIoFailure) => EngineError::Transient(e.to_string()),
            _ => EngineError::Permanent(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            EngineError::Cancelled
        } else {
            EngineError::Permanent(format!("unit task panicked: {}", e))
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Re-run `f` while it fails with `Transient`, at most `limit` extra times.
/// Any other error, or the last transient one, is returned as is.
pub fn retry_transient<T, F>(limit: u32, mut f: F) -> EngineResult<T>
where
    F: FnMut(u32) -> EngineResult<T>,
{
    let mut attempt = 0;
    loop {
        match f(attempt) {
            Err(EngineError::Transient(msg)) if attempt < limit => {
                attempt += 1;
                tracing::debug!(attempt, error = %msg, "transient failure inside unit; retrying");
                std::thread::sleep(std::time::Duration::from_millis(20 * u64::from(attempt)));
            }
            other => return other,
        }
    }
}
