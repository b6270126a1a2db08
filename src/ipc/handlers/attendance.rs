use crate::attendance::{self, decode_statuses, encode_statuses, parse_date, DATE_FORMAT};
use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, db_query_err, now_rfc3339, require_class, required_str};
use crate::ipc::types::{AppState, Request};
use crate::model::AttendanceStatus;
use rusqlite::OptionalExtension;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

fn parse_statuses(req: &Request) -> Result<BTreeMap<String, AttendanceStatus>, serde_json::Value> {
    let Some(obj) = req.params.get("statuses").and_then(|v| v.as_object()) else {
        return Err(err(&req.id, "bad_params", "statuses must be an object", None));
    };
    let mut out = BTreeMap::new();
    for (student_id, raw) in obj {
        let status = raw.as_str().and_then(AttendanceStatus::parse);
        let Some(status) = status else {
            return Err(err(
                &req.id,
                "bad_params",
                "status must be Present, Absent or Late",
                Some(json!({ "studentId": student_id, "status": raw })),
            ));
        };
        out.insert(student_id.clone(), status);
    }
    Ok(out)
}

fn required_date(req: &Request) -> Result<chrono::NaiveDate, serde_json::Value> {
    let raw = required_str(req, "date")?;
    parse_date(&raw)
        .ok_or_else(|| err(&req.id, "bad_params", "date must be YYYY-MM-DD", None))
}

/// Same-day saves merge: later statuses win per student and rosters union.
fn handle_attendance_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date = match required_date(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let statuses = match parse_statuses(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_class(conn, req, &class_id) {
        return e;
    }

    let mut roster: BTreeSet<String> = match req.params.get("roster").and_then(|v| v.as_array()) {
        Some(ids) => ids
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect(),
        None => match calc::load_roster(conn, &class_id) {
            Ok(r) => r.into_iter().map(|s| s.id).collect(),
            Err(e) => return calc_err(req, e),
        },
    };

    let key = attendance::record_key(date, &class_id);
    let existing: Option<(String, String)> = match conn
        .query_row(
            "SELECT roster_json, statuses_json FROM attendance_records WHERE id = ?",
            [&key],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_query_err(req, e),
    };

    let mut merged = BTreeMap::new();
    if let Some((roster_json, statuses_json)) = existing {
        let prior: Vec<String> = serde_json::from_str(&roster_json).unwrap_or_default();
        roster.extend(prior);
        merged = decode_statuses(&statuses_json);
    }
    merged.extend(statuses);
    roster.extend(merged.keys().cloned());

    let roster: Vec<String> = roster.into_iter().collect();
    let roster_json = json!(roster).to_string();
    let statuses_json = encode_statuses(&merged);
    if let Err(e) = conn.execute(
        "INSERT INTO attendance_records(id, date, class_id, roster_json, statuses_json, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           roster_json = excluded.roster_json,
           statuses_json = excluded.statuses_json,
           updated_at = excluded.updated_at",
        (
            &key,
            date.format(DATE_FORMAT).to_string(),
            &class_id,
            &roster_json,
            &statuses_json,
            now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "attendance_records" })),
        );
    }

    tracing::info!(record = %key, marked = merged.len(), "attendance saved");
    ok(
        &req.id,
        json!({
            "recordId": key,
            "rosterSize": roster.len(),
            "marked": merged.len()
        }),
    )
}

fn handle_attendance_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date = match required_date(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = attendance::record_key(date, &class_id);
    let row: Option<(String, String, Option<String>)> = match conn
        .query_row(
            "SELECT roster_json, statuses_json, updated_at FROM attendance_records WHERE id = ?",
            [&key],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_query_err(req, e),
    };
    let Some((roster_json, statuses_json, updated_at)) = row else {
        return ok(&req.id, json!({ "record": null }));
    };
    let roster: Vec<String> = serde_json::from_str(&roster_json).unwrap_or_default();
    let statuses: BTreeMap<String, &str> = decode_statuses(&statuses_json)
        .into_iter()
        .map(|(k, v)| (k, v.as_str()))
        .collect();
    ok(
        &req.id,
        json!({
            "record": {
                "id": key,
                "date": date.format(DATE_FORMAT).to_string(),
                "classId": class_id,
                "roster": roster,
                "statuses": statuses,
                "updatedAt": updated_at
            }
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.save" => Some(handle_attendance_save(state, req)),
        "attendance.get" => Some(handle_attendance_get(state, req)),
        _ => None,
    }
}
