use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    fn spawn() -> Self {
        let exe = env!("CARGO_BIN_EXE_saed");
        let mut child = Command::new(exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn saed");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value["id"], json!(id));
        value
    }

    fn ok(&mut self, method: &str, params: Value) -> Value {
        let resp = self.request(method, params);
        assert_eq!(resp["ok"], json!(true), "{} failed: {}", method, resp);
        resp["result"].clone()
    }

    fn open(workspace: &Path) -> Self {
        let mut s = Self::spawn();
        s.ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy(), "fixedNow": "2025-03-20T10:00:00Z" }),
        );
        s.ok("config.update", json!({ "patch": { "sinks": ["memory"] } }));
        s
    }

    fn recompute(&mut self, class_id: &str, period_id: &str) {
        self.ok("aggregates.recompute", json!({ "classId": class_id, "periodId": period_id }));
        let drained = self.ok("scheduler.drain", json!({ "timeoutMs": 20000 }));
        assert_eq!(drained["idle"], json!(true));
    }

    fn close(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
    }
}

fn term(class_id: &str, pupils: &[&str]) -> Value {
    json!({
        "pupils": pupils.iter().map(|p| json!({ "id": p })).collect::<Vec<_>>(),
        "classes": [{ "id": class_id }],
        "years": [{ "id": "Y25", "startDate": "2024-09-01", "endDate": "2025-07-04" }],
        "periods": [{
            "id": "T1", "yearId": "Y25", "number": 1,
            "startDate": "2025-01-06", "endDate": "2025-03-28"
        }],
        "enrollments": pupils.iter().map(|p| json!({
            "id": format!("{}-{}", class_id, p),
            "pupilId": p,
            "classId": class_id,
            "startDate": "2024-09-01"
        })).collect::<Vec<_>>(),
    })
}

fn evaluation(id: &str, subject: &str, class_id: &str, max: &str, coef: &str) -> Value {
    json!({
        "id": id, "subjectId": subject, "classId": class_id, "periodId": "T1",
        "date": "2025-02-03", "maxScore": max, "coefficient": coef, "published": true
    })
}

fn grade(evaluation_id: &str, pupil_id: &str, score: &str) -> Value {
    json!({ "evaluationId": evaluation_id, "pupilId": pupil_id, "score": score })
}

#[test]
fn subject_and_general_averages_follow_normalized_weights() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let mut s = Sidecar::open(workspace.path());
    s.ok("source.apply", term("C", &["P"]));
    s.ok(
        "source.apply",
        json!({
            "subjects": [{ "id": "M", "shortName": "Maths", "coefficient": "1" }],
            "evaluations": [
                evaluation("E1", "M", "C", "20", "1"),
                evaluation("E2", "M", "C", "10", "2"),
            ],
            "grades": [grade("E1", "P", "12"), grade("E2", "P", "8")],
        }),
    );
    s.recompute("C", "T1");

    let subject = s.ok("aggregates.subject", json!({ "pupilId": "P", "subjectId": "M" }));
    let rows = subject["averages"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["state"], json!("PRESENT"));
    assert_eq!(rows[0]["simpleAverage"], json!(13.33));
    assert_eq!(rows[0]["weightedAverage"], json!(9.33));
    assert_eq!(rows[0]["placement"]["rank"], json!(1));
    assert_eq!(rows[0]["placement"]["classSize"], json!(1));
    assert_eq!(rows[0]["placement"]["classMean"], json!(9.33));

    let general = s.ok("aggregates.general", json!({ "classId": "C", "periodId": "T1" }));
    let rows = general["averages"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["weightedAverage"], json!(9.33));
    assert_eq!(rows[0]["honors"], json!("NONE"));

    let events = s.ok("publisher.peek", json!({}));
    assert!(events["events"]
        .as_array()
        .expect("events")
        .iter()
        .any(|e| e["type"] == json!("AggregateReadyEvent")));
    s.close();
}

#[test]
fn ties_share_a_rank_and_the_next_rank_skips() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let mut s = Sidecar::open(workspace.path());
    s.ok("source.apply", term("C", &["A", "B", "Z"]));
    s.ok(
        "source.apply",
        json!({
            "subjects": [{ "id": "M", "shortName": "Maths", "coefficient": "1" }],
            "evaluations": [evaluation("E1", "M", "C", "20", "1")],
            "grades": [grade("E1", "A", "14"), grade("E1", "B", "14"), grade("E1", "Z", "10")],
        }),
    );
    s.recompute("C", "T1");

    let subject = s.ok("aggregates.subject", json!({ "classId": "C", "subjectId": "M" }));
    let rows = subject["averages"].as_array().expect("rows");
    let ranks: Vec<&Value> = rows.iter().map(|r| &r["placement"]["rank"]).collect();
    assert_eq!(ranks, vec![&json!(1), &json!(1), &json!(3)]);
    for row in rows {
        assert_eq!(row["placement"]["classSize"], json!(3));
        assert_eq!(row["placement"]["classMean"], json!(12.67));
        assert_eq!(row["placement"]["classMin"], json!(10.0));
        assert_eq!(row["placement"]["classMax"], json!(14.0));
    }

    let general = s.ok("aggregates.general", json!({ "classId": "C" }));
    let honors: Vec<&Value> = general["averages"]
        .as_array()
        .expect("rows")
        .iter()
        .map(|r| &r["honors"])
        .collect();
    assert_eq!(
        honors,
        vec![&json!("COMPLIMENTS"), &json!("COMPLIMENTS"), &json!("NONE")]
    );

    // Nothing changed in the source: the second pass leaves every row as it was.
    s.ok("clock.set", json!({ "now": "2025-03-21T10:00:00Z" }));
    s.recompute("C", "T1");
    let again = s.ok("aggregates.subject", json!({ "classId": "C", "subjectId": "M" }));
    assert_eq!(again, subject);
    s.close();
}

#[test]
fn ungraded_subject_is_an_absent_marker_not_zero() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let mut s = Sidecar::open(workspace.path());
    s.ok("source.apply", term("C", &["P"]));
    s.ok(
        "source.apply",
        json!({
            "subjects": [{ "id": "M", "shortName": "Maths", "coefficient": "1" }],
            "evaluations": [evaluation("E1", "M", "C", "20", "1")],
            "grades": [grade("E1", "P", "15")],
        }),
    );
    s.recompute("C", "T1");

    s.ok(
        "source.apply",
        json!({ "grades": [{ "evaluationId": "E1", "pupilId": "P", "absent": true }] }),
    );
    s.recompute("C", "T1");

    let subject = s.ok("aggregates.subject", json!({ "pupilId": "P" }));
    let row = &subject["averages"][0];
    assert_eq!(row["state"], json!("ABSENT"));
    assert_eq!(row["weightedAverage"], Value::Null);
    assert_eq!(row["placement"], Value::Null);

    let general = s.ok("aggregates.general", json!({ "pupilId": "P" }));
    assert_eq!(general["averages"][0]["state"], json!("ABSENT"));
    assert_eq!(general["averages"][0]["honors"], json!("NONE"));
    s.close();
}

#[test]
fn low_general_average_lists_weak_subjects() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let mut s = Sidecar::open(workspace.path());
    s.ok("source.apply", term("C", &["P"]));
    s.ok(
        "source.apply",
        json!({
            "subjects": [
                { "id": "MATH", "shortName": "Math", "coefficient": "1" },
                { "id": "FR", "shortName": "French", "coefficient": "2" },
                { "id": "HIST", "shortName": "History", "coefficient": "1" },
            ],
            "evaluations": [
                evaluation("E-MATH", "MATH", "C", "20", "1"),
                evaluation("E-FR", "FR", "C", "20", "1"),
                evaluation("E-HIST", "HIST", "C", "20", "1"),
            ],
            "grades": [
                grade("E-MATH", "P", "8"),
                grade("E-FR", "P", "9"),
                grade("E-HIST", "P", "12"),
            ],
        }),
    );
    s.recompute("C", "T1");

    let general = s.ok("aggregates.general", json!({ "pupilId": "P" }));
    assert_eq!(general["averages"][0]["weightedAverage"], json!(9.5));
    assert_eq!(general["averages"][0]["simpleAverage"], json!(9.67));

    let risk = s.ok("risk.list", json!({ "periodId": "T1" }));
    let findings = risk["findings"].as_array().expect("findings");
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0]["pupilId"], json!("P"));
    assert_eq!(findings[0]["generalWeighted"], json!(9.5));
    let weak: Vec<&Value> = findings[0]["weakSubjects"]
        .as_array()
        .expect("weak")
        .iter()
        .map(|w| &w["subjectId"])
        .collect();
    assert_eq!(weak, vec![&json!("MATH"), &json!("FR")]);

    // Lifting French above the threshold clears the finding.
    s.ok("source.apply", json!({ "grades": [grade("E-FR", "P", "16")] }));
    s.recompute("C", "T1");
    let risk = s.ok("risk.list", json!({ "pupilId": "P" }));
    assert_eq!(risk["findings"], json!([]));
    s.close();
}

#[test]
fn locked_period_recompute_is_a_no_op() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let mut s = Sidecar::open(workspace.path());
    s.ok("source.apply", term("C", &["P"]));
    s.ok(
        "source.apply",
        json!({
            "subjects": [{ "id": "M", "shortName": "Maths", "coefficient": "1" }],
            "evaluations": [evaluation("E1", "M", "C", "20", "1")],
            "grades": [grade("E1", "P", "12")],
        }),
    );
    s.recompute("C", "T1");
    let before = s.ok("aggregates.subject", json!({ "pupilId": "P" }));

    let locked = s.ok("period.lock", json!({ "periodId": "T1" }));
    assert_eq!(locked["locked"], json!(true));
    s.ok(
        "source.apply",
        json!({
            "evaluations": [evaluation("E2", "M", "C", "20", "1")],
            "grades": [grade("E2", "P", "20")],
        }),
    );
    s.ok("clock.set", json!({ "now": "2025-03-25T10:00:00Z" }));
    s.recompute("C", "T1");

    let after = s.ok("aggregates.subject", json!({ "pupilId": "P" }));
    assert_eq!(after, before);
    let status = s.ok("scheduler.status", json!({}));
    assert_eq!(status["frozen"], json!(1));
    assert_eq!(status["deadLettered"], json!(0));

    s.ok("period.unlock", json!({ "periodId": "T1" }));
    s.recompute("C", "T1");
    let unlocked = s.ok("aggregates.subject", json!({ "pupilId": "P" }));
    assert_eq!(unlocked["averages"][0]["weightedAverage"], json!(16.0));

    let missing = s.request("period.lock", json!({ "periodId": "T9" }));
    assert_eq!(missing["error"]["code"], json!("not_found"));
    s.close();
}

#[test]
fn overlapping_enrollments_reach_the_operator_queue() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let mut s = Sidecar::open(workspace.path());
    s.ok("source.apply", term("C", &["P", "Q"]));
    s.ok(
        "source.apply",
        json!({
            "classes": [{ "id": "D" }],
            "enrollments": [{ "id": "D-P", "pupilId": "P", "classId": "D", "startDate": "2025-01-01" }],
            "subjects": [{ "id": "M", "shortName": "Maths", "coefficient": "1" }],
            "evaluations": [evaluation("E1", "M", "C", "20", "1")],
            "grades": [grade("E1", "P", "12"), grade("E1", "Q", "15")],
        }),
    );
    s.recompute("C", "T1");

    let issues = s.ok("operator.issues", json!({}));
    let issues = issues["issues"].as_array().expect("issues");
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0]["kind"], json!("data_integrity"));
    assert_eq!(issues[0]["pupilId"], json!("P"));

    // The healthy pupil is still ranked.
    let q = s.ok("aggregates.subject", json!({ "pupilId": "Q" }));
    assert_eq!(q["averages"][0]["placement"]["classSize"], json!(1));
    let p = s.ok("aggregates.subject", json!({ "pupilId": "P" }));
    assert_eq!(p["averages"], json!([]));
    s.close();
}
