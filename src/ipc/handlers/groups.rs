use crate::grades::Grade;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, db_query_err, now_rfc3339, optional_str, require_class, required_str, row_exists,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

fn parse_members(
    conn: &Connection,
    req: &Request,
    class_id: &str,
) -> Result<Vec<String>, serde_json::Value> {
    let Some(raw) = req.params.get("members").and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "bad_params", "members must be an array", None));
    };
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for v in raw {
        let Some(id) = v.as_str().map(|s| s.trim()).filter(|s| !s.is_empty()) else {
            return Err(err(
                &req.id,
                "bad_params",
                "members must contain only non-empty student ids",
                None,
            ));
        };
        if !seen.insert(id.to_string()) {
            continue;
        }
        let in_class = conn
            .query_row(
                "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
                (id, class_id),
                |r| r.get::<_, i64>(0),
            )
            .map(|_| true)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                other => Err(other),
            })
            .map_err(|e| db_query_err(req, e))?;
        if !in_class {
            return Err(err(
                &req.id,
                "bad_params",
                "member is not a student of this class",
                Some(json!({ "studentId": id })),
            ));
        }
        out.push(id.to_string());
    }
    if out.is_empty() {
        return Err(err(&req.id, "bad_params", "members must not be empty", None));
    }
    Ok(out)
}

fn handle_groups_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, subject, name, brief, members_json, submission, grade, feedback, created_at
         FROM work_groups
         WHERE class_id = ?
         ORDER BY created_at, rowid",
    ) {
        Ok(s) => s,
        Err(e) => return db_query_err(req, e),
    };
    let rows = stmt
        .query_map([&class_id], |r| {
            let members_json: String = r.get(4)?;
            let members: Vec<String> = serde_json::from_str(&members_json).unwrap_or_default();
            let grade: Option<String> = r.get(6)?;
            let graded = matches!(Grade::parse(grade.as_deref()), Grade::Number(_));
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subject": r.get::<_, Option<String>>(1)?,
                "name": r.get::<_, String>(2)?,
                "brief": r.get::<_, String>(3)?,
                "members": members,
                "submission": r.get::<_, Option<String>>(5)?,
                "grade": grade,
                "graded": graded,
                "feedback": r.get::<_, Option<String>>(7)?,
                "createdAt": r.get::<_, String>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(groups) => ok(&req.id, json!({ "groups": groups })),
        Err(e) => db_query_err(req, e),
    }
}

fn handle_groups_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let brief = optional_str(req, "brief").unwrap_or_default();
    let subject = optional_str(req, "subject");
    if let Err(e) = require_class(conn, req, &class_id) {
        return e;
    }
    let members = match parse_members(conn, req, &class_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let members_json = json!(members).to_string();

    let group_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO work_groups(id, class_id, subject, name, brief, members_json, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &group_id,
            &class_id,
            &subject,
            &name,
            &brief,
            &members_json,
            now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "work_groups" })),
        );
    }
    ok(&req.id, json!({ "groupId": group_id, "members": members }))
}

fn require_group(conn: &Connection, req: &Request) -> Result<String, serde_json::Value> {
    let group_id = required_str(req, "groupId")?;
    match row_exists(conn, "SELECT 1 FROM work_groups WHERE id = ?", &group_id) {
        Ok(true) => Ok(group_id),
        Ok(false) => Err(err(&req.id, "not_found", "group not found", None)),
        Err(e) => Err(db_query_err(req, e)),
    }
}

fn handle_groups_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let group_id = match require_group(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let submission = match required_str(req, "submission") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = conn.execute(
        "UPDATE work_groups SET submission = ? WHERE id = ?",
        (&submission, &group_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

/// Grades are stored as typed; auto-fill only uses ones that read as a number.
fn handle_groups_grade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let group_id = match require_group(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade = match req.params.get("grade") {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return err(&req.id, "bad_params", "grade must be a non-empty string or number", None),
    };
    let feedback = optional_str(req, "feedback");
    if let Err(e) = conn.execute(
        "UPDATE work_groups SET grade = ?, feedback = ? WHERE id = ?",
        (&grade, &feedback, &group_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "grade": grade, "feedback": feedback }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "groups.list" => Some(handle_groups_list(state, req)),
        "groups.create" => Some(handle_groups_create(state, req)),
        "groups.submit" => Some(handle_groups_submit(state, req)),
        "groups.grade" => Some(handle_groups_grade(state, req)),
        _ => None,
    }
}
