use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILE: &str = "saed.sqlite3";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn db_path(workspace: &Path) -> PathBuf {
    workspace.join(DB_FILE)
}

/// Open a connection to an existing workspace without touching the schema.
/// Workers hold their own connections; readers and the writer never share one.
pub fn open_connection(workspace: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path(workspace))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    Ok(conn)
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let conn = open_connection(workspace)?;
    // Snapshot reads on one connection while another commits require WAL.
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        anyhow::bail!("workspace database refused WAL journaling (got {})", mode);
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    create_source_tables(&conn)?;
    create_derived_tables(&conn)?;
    create_engine_tables(&conn)?;

    Ok(conn)
}

// Source tables are owned by the school platform; the engine only reads them.
// No foreign keys: out-of-order writes and dangling references are surfaced
// as permanent unit failures instead of rejected inserts.
fn create_source_tables(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pupils(
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS periods(
            id TEXT PRIMARY KEY,
            year_id TEXT NOT NULL,
            number INTEGER NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            grades_locked INTEGER NOT NULL DEFAULT 0,
            locked_at TEXT,
            version INTEGER NOT NULL DEFAULT 0,
            UNIQUE(year_id, number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            short_name TEXT NOT NULL,
            coefficient TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            pupil_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            active INTEGER NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT,
            version INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_class ON enrollments(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_pupil ON enrollments(pupil_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS scheduled_sessions(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            date TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL DEFAULT 60
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_class_date ON scheduled_sessions(class_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            pupil_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            justified INTEGER NOT NULL DEFAULT 0,
            late_minutes INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(pupil_id, session_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_pupil_date ON attendance(pupil_id, date, session_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluations(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            teacher_id TEXT,
            period_id TEXT NOT NULL,
            date TEXT NOT NULL,
            max_score TEXT NOT NULL,
            coefficient TEXT NOT NULL,
            counts_in_average INTEGER NOT NULL DEFAULT 1,
            published INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_class_period ON evaluations(class_id, period_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            evaluation_id TEXT NOT NULL,
            pupil_id TEXT NOT NULL,
            score TEXT,
            absent INTEGER NOT NULL DEFAULT 0,
            cheating INTEGER NOT NULL DEFAULT 0,
            excused INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(evaluation_id, pupil_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_pupil ON grades(pupil_id)",
        [],
    )?;
    Ok(())
}

fn create_derived_tables(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_averages(
            pupil_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            state TEXT NOT NULL,
            simple_average TEXT,
            weighted_average TEXT,
            rank INTEGER,
            class_size INTEGER,
            class_min TEXT,
            class_max TEXT,
            class_mean TEXT,
            input_digest TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(pupil_id, subject_id, period_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_averages_class_period ON subject_averages(class_id, period_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS general_averages(
            pupil_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            state TEXT NOT NULL,
            simple_average TEXT,
            weighted_average TEXT,
            rank INTEGER,
            class_size INTEGER,
            class_min TEXT,
            class_max TEXT,
            class_mean TEXT,
            honors TEXT NOT NULL,
            input_digest TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(pupil_id, period_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_general_averages_class_period ON general_averages(class_id, period_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS alerts(
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            pupil_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            threshold INTEGER NOT NULL,
            observed_value INTEGER NOT NULL,
            detail_json TEXT NOT NULL,
            state TEXT NOT NULL,
            created_at TEXT NOT NULL,
            acknowledged_at TEXT,
            resolved_at TEXT
        )",
        [],
    )?;
    // At most one live alert per natural key.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_live_key
         ON alerts(pupil_id, kind, window_start, window_end)
         WHERE state IN ('OPEN', 'ACKNOWLEDGED')",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_alerts_pupil_state ON alerts(pupil_id, state)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS alert_transitions(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            alert_id TEXT NOT NULL,
            from_state TEXT,
            to_state TEXT NOT NULL,
            at TEXT NOT NULL,
            FOREIGN KEY(alert_id) REFERENCES alerts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_alert_transitions_alert ON alert_transitions(alert_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS risk_findings(
            pupil_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            state TEXT NOT NULL,
            general_simple TEXT,
            general_weighted TEXT,
            weak_subjects_json TEXT NOT NULL,
            input_digest TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(pupil_id, period_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_risk_findings_class_period ON risk_findings(class_id, period_id)",
        [],
    )?;
    Ok(())
}

fn create_engine_tables(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS dead_letters(
            id TEXT PRIMARY KEY,
            unit_key TEXT NOT NULL,
            unit_json TEXT NOT NULL,
            error_kind TEXT NOT NULL,
            error TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            parked_at TEXT NOT NULL,
            requeued_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS operator_issues(
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            unit_key TEXT NOT NULL,
            pupil_id TEXT,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS publisher_checkpoints(
            sink TEXT NOT NULL,
            pupil_id TEXT NOT NULL,
            last_seq INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(sink, pupil_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS event_versions(
            record_key TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            occurred_at TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

#[cfg(test)]
fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_db_is_idempotent_and_uses_wal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open_db(dir.path()).expect("first open");
        drop(conn);
        let conn = open_db(dir.path()).expect("second open");
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .expect("journal mode");
        assert_eq!(mode.to_ascii_lowercase(), "wal");
        assert!(table_has_column(&conn, "alerts", "acknowledged_at").expect("pragma"));
        assert!(table_has_column(&conn, "periods", "locked_at").expect("pragma"));
    }

    #[test]
    fn settings_json_upserts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open_db(dir.path()).expect("open");
        assert!(settings_get_json(&conn, "k").expect("get").is_none());
        settings_set_json(&conn, "k", &serde_json::json!({ "a": 1 })).expect("set");
        settings_set_json(&conn, "k", &serde_json::json!({ "a": 2 })).expect("set");
        let v = settings_get_json(&conn, "k").expect("get").expect("present");
        assert_eq!(v["a"], 2);
    }
}
