use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_saed");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn saed");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn read_response(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let value = read_response(reader);
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn error_code(resp: &serde_json::Value) -> Option<&str> {
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

#[test]
fn unknown_methods_and_bad_json_get_coded_errors() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["ok"], json!(true));
    assert!(health["result"]["version"].is_string());
    assert_eq!(health["result"]["workspacePath"], serde_json::Value::Null);

    let unknown = request(&mut stdin, &mut reader, "2", "grades.teleport", json!({}));
    assert_eq!(unknown["ok"], json!(false));
    assert_eq!(error_code(&unknown), Some("not_implemented"));

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let bad = read_response(&mut reader);
    assert_eq!(bad["ok"], json!(false));
    assert_eq!(error_code(&bad), Some("bad_json"));

    let before = request(&mut stdin, &mut reader, "3", "alerts.list", json!({}));
    assert_eq!(error_code(&before), Some("no_workspace"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let selected = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy(), "fixedNow": "2025-03-28T12:00:00Z" }),
    );
    assert_eq!(selected["ok"], json!(true), "{}", selected);
    assert_eq!(selected["result"]["clockFixed"], json!(true));

    let calls = [
        ("health", json!({})),
        ("config.get", json!({})),
        ("config.update", json!({ "patch": { "sinks": ["memory"] } })),
        ("clock.set", json!({ "now": "2025-03-29T12:00:00Z" })),
        ("source.apply", json!({ "pupils": [{ "id": "P1" }] })),
        ("period.lock", json!({ "periodId": "missing" })),
        ("period.unlock", json!({ "periodId": "missing" })),
        ("events.ingest", json!({ "event": { "kind": "attendance.recorded", "pupilId": "P1" } })),
        ("alerts.sweep", json!({ "pupilId": "P1" })),
        ("aggregates.recompute", json!({ "classId": "C", "periodId": "T1" })),
        ("sweep.runDaily", json!({})),
        ("scheduler.drain", json!({ "timeoutMs": 10000 })),
        ("scheduler.status", json!({})),
        ("deadLetters.list", json!({})),
        ("deadLetters.requeue", json!({ "id": "missing" })),
        ("aggregates.subject", json!({})),
        ("aggregates.general", json!({})),
        ("risk.list", json!({})),
        ("alerts.list", json!({})),
        ("alerts.history", json!({ "alertId": "missing" })),
        ("alerts.transition", json!({ "alertId": "missing", "state": "RESOLVED" })),
        ("operator.issues", json!({})),
        ("publisher.replay", json!({})),
        ("publisher.peek", json!({})),
    ];
    for (i, (method, params)) in calls.iter().enumerate() {
        let resp = request(&mut stdin, &mut reader, &format!("c{}", i), method, params.clone());
        assert_ne!(
            error_code(&resp),
            Some("not_implemented"),
            "unexpected unknown method for {}",
            method
        );
    }

    let clock = request(&mut stdin, &mut reader, "h", "health", json!({}));
    assert_eq!(clock["result"]["now"], json!("2025-03-29T12:00:00.000Z"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn clock_set_requires_a_fixed_clock() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let selected = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    assert_eq!(selected["ok"], json!(true), "{}", selected);

    let set = request(
        &mut stdin,
        &mut reader,
        "2",
        "clock.set",
        json!({ "now": "2025-03-29T12:00:00Z" }),
    );
    assert_eq!(error_code(&set), Some("clock_not_fixed"));

    let bad = request(&mut stdin, &mut reader, "3", "clock.set", json!({ "now": "yesterday" }));
    assert_eq!(error_code(&bad), Some("bad_params"));

    drop(stdin);
    let _ = child.wait();
}
