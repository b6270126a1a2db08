use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    fn spawn() -> Self {
        let exe = env!("CARGO_BIN_EXE_schoold");
        let mut child = Command::new(exe)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn schoold");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response");
        assert_eq!(value["id"], json!(id));
        value
    }

    fn request_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.call(method, params);
        assert_eq!(value["ok"], json!(true), "{} failed: {}", method, value);
        value["result"].clone()
    }

    fn error_code(&mut self, method: &str, params: serde_json::Value) -> String {
        let value = self.call(method, params);
        assert_eq!(value["ok"], json!(false), "{} unexpectedly ok: {}", method, value);
        value["error"]["code"].as_str().unwrap_or("").to_string()
    }

    fn finish(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
    }
}

fn approx(v: &serde_json::Value, expected: f64) {
    let got = v.as_f64().unwrap_or_else(|| panic!("not a number: {}", v));
    assert!((got - expected).abs() < 1e-9, "expected {}, got {}", expected, got);
}

fn setup_class(sidecar: &mut Sidecar, workspace: &Path, names: &[&str]) -> (String, Vec<String>) {
    sidecar.request_ok(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = sidecar.request_ok("classes.create", json!({ "name": "Basic 6" }))["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let students = names
        .iter()
        .map(|name| {
            sidecar.request_ok(
                "students.create",
                json!({ "classId": class_id, "name": name }),
            )["studentId"]
                .as_str()
                .expect("studentId")
                .to_string()
        })
        .collect();
    (class_id, students)
}

fn stored_marks_json(workspace: &Path, report_key: &str, subject: &str) -> String {
    let conn = rusqlite::Connection::open(workspace.join("school.sqlite3")).expect("open db");
    conn.query_row(
        "SELECT marks_json FROM terminal_report_subjects WHERE report_id = ? AND subject = ?",
        (report_key, subject),
        |r| r.get(0),
    )
    .expect("marks row")
}

#[test]
fn calculate_and_save_scores_ranks_and_persists() {
    let workspace = temp_dir("schoold-report-flow");
    let mut sidecar = Sidecar::spawn();
    let (class_id, s) = setup_class(&mut sidecar, &workspace, &["Ama", "Kofi", "Esi", "Yaw"]);

    let maths_entries = json!([
        { "studentId": s[0], "indivTest": 12, "groupWork": 10, "classTest": 8, "project": 9, "endOfTermExams": 70 },
        { "studentId": s[1], "indivTest": 15, "groupWork": 15, "classTest": 15, "project": 15, "endOfTermExams": 100 },
        { "studentId": s[2], "indivTest": "12", "groupWork": 10, "classTest": 8, "project": 9, "endOfTermExams": 70 },
    ]);
    let saved = sidecar.request_ok(
        "reports.calculateAndSave",
        json!({
            "classId": class_id,
            "subject": "Mathematics",
            "academicYear": "2025/2026",
            "term": "Term 1",
            "entries": maths_entries
        }),
    );
    let key = format!("2025-2026_Term 1_{}", class_id);
    assert_eq!(saved["reportKey"], json!(key));
    assert_eq!(saved["autofilled"], json!(false));

    let ama = &saved["marks"][&s[0]];
    assert_eq!(ama["studentName"], json!("Ama"));
    approx(&ama["totalClassScore"], 39.0);
    approx(&ama["scaledClassScore"], 32.5);
    approx(&ama["scaledExamScore"], 35.0);
    approx(&ama["overallTotal"], 67.5);
    assert_eq!(ama["grade"], json!("B"));

    let kofi = &saved["marks"][&s[1]];
    approx(&kofi["overallTotal"], 100.0);
    assert_eq!(kofi["grade"], json!("A"));

    // 1,2,2,4: the tie shares a position and the next total skips ahead.
    let positions: Vec<u64> = s
        .iter()
        .map(|id| saved["marks"][id]["position"].as_u64().expect("position"))
        .collect();
    assert_eq!(positions, vec![2, 1, 2, 4]);

    // A student without an entry is still on the table with zeros.
    let yaw = &saved["marks"][&s[3]];
    approx(&yaw["overallTotal"], 0.0);
    assert_eq!(yaw["grade"], json!("F"));
    assert!(yaw.get("indivTest").is_none());

    let before = stored_marks_json(&workspace, &key, "Mathematics");
    sidecar.request_ok(
        "reports.calculateAndSave",
        json!({
            "classId": class_id,
            "subject": "Mathematics",
            "academicYear": "2025/2026",
            "term": "Term 1",
            "entries": maths_entries
        }),
    );
    let after = stored_marks_json(&workspace, &key, "Mathematics");
    assert_eq!(before, after, "recalculation must be byte-identical");

    sidecar.request_ok(
        "reports.calculateAndSave",
        json!({
            "classId": class_id,
            "subject": "English",
            "academicYear": "2025/2026",
            "term": "Term 1",
            "entries": [
                { "studentId": s[0], "indivTest": 15, "groupWork": 15, "classTest": 15, "project": 15, "endOfTermExams": 90 }
            ]
        }),
    );

    let opened = sidecar.request_ok("reports.open", json!({ "reportKey": key }));
    let subjects = opened["report"]["subjects"].as_object().expect("subjects");
    assert_eq!(subjects.len(), 2, "saving English must keep Mathematics");
    assert_eq!(
        opened["report"]["subjects"]["Mathematics"][&s[0]],
        saved["marks"][&s[0]]
    );
    assert_eq!(opened["report"]["academicYear"], json!("2025/2026"));

    let listed = sidecar.request_ok("reports.list", json!({ "classId": class_id }));
    assert_eq!(listed["reports"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(listed["reports"][0]["subjectCount"], json!(2));

    let card = sidecar.request_ok(
        "reports.studentCard",
        json!({ "reportKey": key, "studentId": s[0] }),
    );
    assert_eq!(card["studentId"], json!(s[0]));
    assert_eq!(card["subjects"].as_array().map(|a| a.len()), Some(2));
    // English: 60 class -> 50 scaled, 90 exam -> 45, total 95; mean with 67.5 is 81.25
    approx(&card["averageOverall"], 81.3);
    assert_eq!(card["subjects"][0]["classSize"], json!(4));

    sidecar.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn stored_values_are_returned_verbatim() {
    let workspace = temp_dir("schoold-report-verbatim");
    let mut sidecar = Sidecar::spawn();
    let (class_id, s) = setup_class(&mut sidecar, &workspace, &["Ama"]);

    let saved = sidecar.request_ok(
        "reports.calculateAndSave",
        json!({
            "classId": class_id,
            "subject": "Science",
            "entries": [{ "studentId": s[0], "indivTest": 10, "endOfTermExams": 50 }]
        }),
    );
    let key = saved["reportKey"].as_str().expect("reportKey").to_string();

    // Tamper with the stored row: open must not recompute it.
    let conn = rusqlite::Connection::open(workspace.join("school.sqlite3")).expect("open db");
    let stored = stored_marks_json(&workspace, &key, "Science");
    let mut marks: serde_json::Value = serde_json::from_str(&stored).expect("marks json");
    marks[&s[0]]["overallTotal"] = json!(99.9);
    conn.execute(
        "UPDATE terminal_report_subjects SET marks_json = ? WHERE report_id = ?",
        (marks.to_string(), &key),
    )
    .expect("update marks");
    drop(conn);

    let opened = sidecar.request_ok("reports.open", json!({ "reportKey": key }));
    approx(&opened["report"]["subjects"]["Science"][&s[0]]["overallTotal"], 99.9);

    sidecar.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bad_entries_and_missing_reports_are_rejected() {
    let workspace = temp_dir("schoold-report-errors");
    let mut sidecar = Sidecar::spawn();
    let (class_id, s) = setup_class(&mut sidecar, &workspace, &["Ama"]);

    let code = sidecar.error_code(
        "reports.calculateAndSave",
        json!({
            "classId": class_id,
            "subject": "Science",
            "entries": [{ "studentId": "someone-else", "indivTest": 10 }]
        }),
    );
    assert_eq!(code, "bad_params");

    let code = sidecar.error_code(
        "reports.calculateAndSave",
        json!({
            "classId": class_id,
            "subject": "Science",
            "entries": [{ "studentId": s[0], "indivTest": "ten" }]
        }),
    );
    assert_eq!(code, "bad_params");

    let code = sidecar.error_code(
        "reports.calculateAndSave",
        json!({ "classId": "missing", "subject": "Science", "entries": [] }),
    );
    assert_eq!(code, "not_found");

    let code = sidecar.error_code("reports.open", json!({ "reportKey": "2025-2026_Term 1_x" }));
    assert_eq!(code, "not_found");

    // Out-of-range scores are accepted as entered.
    let saved = sidecar.request_ok(
        "reports.calculateAndSave",
        json!({
            "classId": class_id,
            "subject": "Science",
            "entries": [{ "studentId": s[0], "indivTest": 30, "endOfTermExams": null }]
        }),
    );
    approx(&saved["marks"][&s[0]]["totalClassScore"], 30.0);

    sidecar.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn autofill_bridge_feeds_indiv_test_and_group_work() {
    let workspace = temp_dir("schoold-report-autofill");
    let mut sidecar = Sidecar::spawn();
    let (class_id, s) = setup_class(&mut sidecar, &workspace, &["Ama", "Kofi", "Esi"]);

    let a1 = sidecar.request_ok(
        "assignments.create",
        json!({ "classId": class_id, "subject": "Science", "title": "Plants" }),
    )["assignmentId"]
        .as_str()
        .expect("a1")
        .to_string();
    let a2 = sidecar.request_ok(
        "assignments.create",
        json!({ "classId": class_id, "subject": "Science", "title": "Animals", "dueDate": "2026-10-20" }),
    )["assignmentId"]
        .as_str()
        .expect("a2")
        .to_string();
    // Another subject must not count.
    let other = sidecar.request_ok(
        "assignments.create",
        json!({ "classId": class_id, "subject": "English", "title": "Essay" }),
    )["assignmentId"]
        .as_str()
        .expect("other")
        .to_string();

    for (assignment, student, grade) in [
        (&a1, &s[0], json!("15/20")),
        (&a2, &s[0], json!(18)),
        (&a1, &s[1], json!("A")),
        (&other, &s[2], json!("20/20")),
    ] {
        sidecar.request_ok(
            "submissions.grade",
            json!({ "assignmentId": assignment, "studentId": student, "grade": grade }),
        );
    }
    // Submitted but not graded is ignored.
    sidecar.request_ok(
        "submissions.submit",
        json!({ "assignmentId": a2, "studentId": s[2] }),
    );

    let group = sidecar.request_ok(
        "groups.create",
        json!({ "classId": class_id, "subject": "Science", "name": "Team A", "members": [s[0], s[2]] }),
    )["groupId"]
        .as_str()
        .expect("groupId")
        .to_string();
    sidecar.request_ok("groups.grade", json!({ "groupId": group, "grade": "13" }));

    let preview = sidecar.request_ok(
        "reports.autofill",
        json!({ "classId": class_id, "subject": "Science" }),
    );
    assert_eq!(preview["assignmentCount"], json!(2));
    // (15/20 + 18/20) / 2 * 15 = 12.375 -> 12.4
    approx(&preview["students"][&s[0]]["indivTest"], 12.4);
    approx(&preview["students"][&s[0]]["groupWork"], 13.0);
    // Letter grades carry no score ratio.
    approx(&preview["students"][&s[1]]["indivTest"], 0.0);
    assert_eq!(preview["students"][&s[1]]["groupWork"], json!(null));
    approx(&preview["students"][&s[2]]["indivTest"], 0.0);
    approx(&preview["students"][&s[2]]["groupWork"], 13.0);

    // The preview does not persist anything.
    let listed = sidecar.request_ok("reports.list", json!({ "classId": class_id }));
    assert_eq!(listed["reports"], json!([]));

    let saved = sidecar.request_ok(
        "reports.calculateAndSave",
        json!({
            "classId": class_id,
            "subject": "Science",
            "autofill": true,
            "entries": [
                { "studentId": s[0], "indivTest": 1, "groupWork": 1, "classTest": 10, "project": 10, "endOfTermExams": 80 }
            ]
        }),
    );
    assert_eq!(saved["autofilled"], json!(true));
    let ama = &saved["marks"][&s[0]];
    approx(&ama["indivTest"], 12.4);
    approx(&ama["groupWork"], 13.0);
    approx(&ama["classTest"], 10.0);
    approx(&ama["totalClassScore"], 45.4);
    approx(&ama["scaledClassScore"], 37.8);
    approx(&ama["overallTotal"], 77.8);
    assert_eq!(ama["grade"], json!("B+"));
    assert_eq!(ama["position"], json!(1));

    sidecar.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn report_scope_follows_school_settings() {
    let workspace = temp_dir("schoold-report-scope");
    let mut sidecar = Sidecar::spawn();
    let (class_id, s) = setup_class(&mut sidecar, &workspace, &["Ama"]);

    sidecar.request_ok(
        "setup.update",
        json!({
            "section": "school",
            "patch": { "schoolName": "Adenta Basic School", "academicYear": "2026/2027", "term": "Term 2" }
        }),
    );
    let saved = sidecar.request_ok(
        "reports.calculateAndSave",
        json!({ "classId": class_id, "subject": "Science", "entries": [] }),
    );
    assert_eq!(
        saved["reportKey"],
        json!(format!("2026-2027_Term 2_{}", class_id))
    );

    let card = sidecar.request_ok(
        "reports.studentCard",
        json!({ "classId": class_id, "studentId": s[0] }),
    );
    assert_eq!(card["schoolName"], json!("Adenta Basic School"));

    let overridden = sidecar.request_ok(
        "reports.calculateAndSave",
        json!({ "classId": class_id, "subject": "Science", "term": "Term 3", "entries": [] }),
    );
    assert_eq!(
        overridden["reportKey"],
        json!(format!("2026-2027_Term 3_{}", class_id))
    );

    sidecar.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn non_finite_scores_read_as_blank() {
    let workspace = temp_dir("schoold-report-nonfinite");
    let mut sidecar = Sidecar::spawn();
    let (class_id, s) = setup_class(&mut sidecar, &workspace, &["Ama", "Kofi"]);

    let saved = sidecar.request_ok(
        "reports.calculateAndSave",
        json!({
            "classId": class_id,
            "subject": "Science",
            "academicYear": "2025/2026",
            "term": "Term 1",
            "entries": [
                { "studentId": s[0], "indivTest": "NaN", "endOfTermExams": 10 },
                { "studentId": s[1], "classTest": "inf", "project": "-infinity", "endOfTermExams": 90 }
            ]
        }),
    );
    let ama = &saved["marks"][&s[0]];
    assert_eq!(ama["indivTest"], json!(null));
    approx(&ama["overallTotal"], 5.0);
    assert_eq!(ama["position"], json!(2));
    let kofi = &saved["marks"][&s[1]];
    assert_eq!(kofi["classTest"], json!(null));
    approx(&kofi["overallTotal"], 45.0);
    assert_eq!(kofi["position"], json!(1));

    let key = saved["reportKey"].as_str().expect("reportKey").to_string();
    let opened = sidecar.request_ok("reports.open", json!({ "reportKey": key }));
    approx(&opened["report"]["subjects"]["Science"][&s[0]]["overallTotal"], 5.0);
    approx(&opened["report"]["subjects"]["Science"][&s[1]]["overallTotal"], 45.0);

    sidecar.finish();
    let _ = std::fs::remove_dir_all(workspace);
}
