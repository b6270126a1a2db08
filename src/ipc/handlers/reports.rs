use crate::autofill;
use crate::calc::{self, CalcContext, ComponentScores, ReportScope};
use crate::config;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, optional_str, require_class, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;

/// Request values win over the configured school year and term.
fn resolve_scope(conn: &Connection, req: &Request) -> Result<ReportScope, serde_json::Value> {
    let year = optional_str(req, "academicYear");
    let term = optional_str(req, "term");
    if let (Some(academic_year), Some(term)) = (year.clone(), term.clone()) {
        return Ok(ReportScope {
            academic_year,
            term,
        });
    }
    let school = config::school_settings(conn)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    Ok(ReportScope {
        academic_year: year.unwrap_or(school.academic_year),
        term: term.unwrap_or(school.term),
    })
}

/// Numbers, numeric strings, blanks and nulls; anything else is rejected.
/// `NaN` and infinities read as blank.
fn score_field(v: Option<&serde_json::Value>) -> Result<Option<f64>, ()> {
    let n = match v {
        None | Some(serde_json::Value::Null) => return Ok(None),
        Some(serde_json::Value::Number(n)) => n.as_f64().ok_or(())?,
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().map_err(|_| ())?,
        Some(_) => return Err(()),
    };
    Ok(Some(n).filter(|n| n.is_finite()))
}

fn parse_entries(req: &Request) -> Result<HashMap<String, ComponentScores>, serde_json::Value> {
    let raw = match req.params.get("entries") {
        None | Some(serde_json::Value::Null) => return Ok(HashMap::new()),
        Some(serde_json::Value::Array(a)) => a,
        Some(_) => return Err(err(&req.id, "bad_params", "entries must be an array", None)),
    };
    let mut out = HashMap::new();
    for (i, entry) in raw.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            return Err(err(
                &req.id,
                "bad_params",
                "entry must be an object",
                Some(json!({ "index": i })),
            ));
        };
        let Some(student_id) = obj
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
        else {
            return Err(err(
                &req.id,
                "bad_params",
                "entry is missing studentId",
                Some(json!({ "index": i })),
            ));
        };

        let mut scores = ComponentScores::default();
        for (key, slot) in [
            ("indivTest", &mut scores.indiv_test),
            ("groupWork", &mut scores.group_work),
            ("classTest", &mut scores.class_test),
            ("project", &mut scores.project),
            ("endOfTermExams", &mut scores.end_of_term_exams),
        ] {
            *slot = score_field(obj.get(key)).map_err(|_| {
                err(
                    &req.id,
                    "bad_params",
                    format!("{} must be a number", key),
                    Some(json!({ "studentId": student_id })),
                )
            })?;
        }
        out.insert(student_id.to_string(), scores);
    }
    Ok(out)
}

fn autofill_config(conn: &Connection, req: &Request) -> Result<autofill::AutofillConfig, serde_json::Value> {
    config::autofill_settings(conn).map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

fn handle_reports_autofill(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject = match required_str(req, "subject") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_class(conn, req, &class_id) {
        return e;
    }
    let cfg = match autofill_config(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let loaded = calc::load_roster(conn, &class_id).and_then(|roster| {
        let snapshot = autofill::load_snapshot(conn, &class_id, &subject)?;
        Ok((roster, snapshot))
    });
    let (roster, snapshot) = match loaded {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let filled = autofill::autofill_components(&roster, &snapshot, &cfg);
    ok(
        &req.id,
        json!({
            "classId": class_id,
            "subject": subject,
            "assignmentCount": snapshot.assignment_ids.len(),
            "students": filled
        }),
    )
}

fn handle_reports_calculate_and_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject = match required_str(req, "subject") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let entries = match parse_entries(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match resolve_scope(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let use_autofill = req
        .params
        .get("autofill")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let cfg = if use_autofill {
        match autofill_config(conn, req) {
            Ok(v) => Some(v),
            Err(e) => return e,
        }
    } else {
        None
    };

    let ctx = CalcContext {
        conn,
        class_id: &class_id,
        subject: &subject,
        scope: &scope,
    };
    let saved = match calc::calculate_and_save(&ctx, entries, cfg.as_ref()) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    tracing::info!(
        report = %saved.report_key,
        subject = %saved.subject,
        students = saved.marks.len(),
        autofilled = saved.autofilled,
        "terminal report subject saved"
    );
    match serde_json::to_value(&saved) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
    }
}

fn requested_report_key(conn: &Connection, req: &Request) -> Result<String, serde_json::Value> {
    if let Some(key) = optional_str(req, "reportKey") {
        return Ok(key);
    }
    let class_id = required_str(req, "classId")?;
    let scope = resolve_scope(conn, req)?;
    Ok(calc::report_key(&scope.academic_year, &scope.term, &class_id))
}

fn handle_reports_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match requested_report_key(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match calc::load_report(conn, &key) {
        Ok(Some(report)) => match serde_json::to_value(&report) {
            Ok(v) => ok(&req.id, json!({ "report": v })),
            Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
        },
        Ok(None) => err(
            &req.id,
            "not_found",
            "report not found",
            Some(json!({ "reportKey": key })),
        ),
        Err(e) => calc_err(req, e),
    }
}

fn handle_reports_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = optional_str(req, "classId");
    let mut stmt = match conn.prepare(
        "SELECT r.id, r.academic_year, r.term, r.class_id, r.updated_at,
           (SELECT COUNT(*) FROM terminal_report_subjects s WHERE s.report_id = r.id)
         FROM terminal_reports r
         WHERE ?1 IS NULL OR r.class_id = ?1
         ORDER BY r.academic_year DESC, r.term, r.class_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([class_id.as_deref()], |r| {
            Ok(json!({
                "reportKey": r.get::<_, String>(0)?,
                "academicYear": r.get::<_, String>(1)?,
                "term": r.get::<_, String>(2)?,
                "classId": r.get::<_, String>(3)?,
                "updatedAt": r.get::<_, Option<String>>(4)?,
                "subjectCount": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(reports) => ok(&req.id, json!({ "reports": reports })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_reports_student_card(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match requested_report_key(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let report = match calc::load_report(conn, &key) {
        Ok(Some(r)) => r,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "report not found",
                Some(json!({ "reportKey": key })),
            )
        }
        Err(e) => return calc_err(req, e),
    };
    let school = match config::school_settings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let card = calc::student_card(&report, &student_id);
    match serde_json::to_value(&card) {
        Ok(mut v) => {
            if let Some(obj) = v.as_object_mut() {
                obj.insert("schoolName".into(), json!(school.school_name));
            }
            ok(&req.id, v)
        }
        Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.autofill" => Some(handle_reports_autofill(state, req)),
        "reports.calculateAndSave" => Some(handle_reports_calculate_and_save(state, req)),
        "reports.open" => Some(handle_reports_open(state, req)),
        "reports.list" => Some(handle_reports_list(state, req)),
        "reports.studentCard" => Some(handle_reports_student_card(state, req)),
        _ => None,
    }
}
