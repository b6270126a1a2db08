use crate::attendance::{self, parse_date, AttendanceWindow};
use crate::calc;
use crate::config;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, optional_str, require_class, required_str};
use crate::ipc::types::{AppState, Request};
use crate::performance;
use serde_json::json;

fn handle_analytics_attendance(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = optional_str(req, "classId");
    if let Some(class_id) = class_id.as_deref() {
        if let Err(e) = require_class(conn, req, class_id) {
            return e;
        }
    }
    let today = match optional_str(req, "today") {
        None => chrono::Local::now().date_naive(),
        Some(raw) => match parse_date(&raw) {
            Some(d) => d,
            None => return err(&req.id, "bad_params", "today must be YYYY-MM-DD", None),
        },
    };
    let settings = match config::attendance_settings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let days = match req.params.get("windowDays") {
        None | Some(serde_json::Value::Null) => settings.window_days,
        Some(v) => match config::parse_i64_range(v, "windowDays", 1, config::MAX_WINDOW_DAYS) {
            Ok(d) => d,
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        },
    };
    let window = AttendanceWindow { today, days };

    let records = match attendance::load_records_since(conn, window.start(), class_id.as_deref()) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let model =
        attendance::analyze_attendance(&records, &window, class_id.as_deref(), &settings.trend);
    tracing::debug!(
        records = records.len(),
        days = model.days.len(),
        "attendance analytics computed"
    );
    match serde_json::to_value(model) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
    }
}

fn handle_analytics_performance(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject = optional_str(req, "subject");
    if let Err(e) = require_class(conn, req, &class_id) {
        return e;
    }

    let loaded = calc::load_roster(conn, &class_id).and_then(|roster| {
        let assignments = performance::load_assignments(conn, &class_id, subject.as_deref())?;
        let submissions = performance::load_submissions(conn, &class_id, subject.as_deref())?;
        Ok((roster, assignments, submissions))
    });
    let (roster, assignments, submissions) = match loaded {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let model = performance::summarize_performance(&roster, &assignments, &submissions);
    match serde_json::to_value(model) {
        Ok(v) => ok(
            &req.id,
            json!({ "classId": class_id, "subject": subject, "performance": v }),
        ),
        Err(e) => err(&req.id, "serialize_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analytics.attendance" => Some(handle_analytics_attendance(state, req)),
        "analytics.performance" => Some(handle_analytics_performance(state, req)),
        _ => None,
    }
}
