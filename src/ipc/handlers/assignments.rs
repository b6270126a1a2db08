use crate::attendance::parse_date;
use crate::grades::{grade_percentage, Grade};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, db_query_err, now_rfc3339, optional_str, require_class, required_str, row_exists,
};
use crate::ipc::types::{AppState, Request};
use crate::model::SubmissionStatus;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_assignments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject = optional_str(req, "subject");

    let mut stmt = match conn.prepare(
        "SELECT a.id, a.subject, a.title, a.due_date, a.has_quiz, a.created_at,
           (SELECT COUNT(*) FROM submissions s WHERE s.assignment_id = a.id) AS submission_count,
           (SELECT COUNT(*) FROM submissions s
              WHERE s.assignment_id = a.id AND s.status = 'Graded') AS graded_count
         FROM assignments a
         WHERE a.class_id = ?1 AND (?2 IS NULL OR a.subject = ?2)
         ORDER BY a.created_at, a.rowid",
    ) {
        Ok(s) => s,
        Err(e) => return db_query_err(req, e),
    };
    let rows = stmt
        .query_map((&class_id, subject.as_deref()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subject": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "dueDate": r.get::<_, Option<String>>(3)?,
                "hasQuiz": r.get::<_, i64>(4)? != 0,
                "createdAt": r.get::<_, String>(5)?,
                "submissionCount": r.get::<_, i64>(6)?,
                "gradedCount": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => db_query_err(req, e),
    }
}

fn handle_assignments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let due_date = match optional_str(req, "dueDate") {
        None => None,
        Some(raw) => match parse_date(&raw) {
            Some(d) => Some(d.format("%Y-%m-%d").to_string()),
            None => return err(&req.id, "bad_params", "dueDate must be YYYY-MM-DD", None),
        },
    };
    let has_quiz = req
        .params
        .get("hasQuiz")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if let Err(e) = require_class(conn, req, &class_id) {
        return e;
    }

    let assignment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO assignments(id, class_id, subject, title, due_date, has_quiz, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &assignment_id,
            &class_id,
            &subject,
            &title,
            &due_date,
            has_quiz as i64,
            now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }
    ok(&req.id, json!({ "assignmentId": assignment_id }))
}

fn handle_assignments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match row_exists(conn, "SELECT 1 FROM assignments WHERE id = ?", &assignment_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "assignment not found", None),
        Err(e) => return db_query_err(req, e),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (table, sql) in [
        ("submissions", "DELETE FROM submissions WHERE assignment_id = ?"),
        ("assignments", "DELETE FROM assignments WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&assignment_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

/// Class of the assignment, provided the student sits in that class.
fn assignment_class_for_student(
    conn: &Connection,
    req: &Request,
    assignment_id: &str,
    student_id: &str,
) -> Result<String, serde_json::Value> {
    let class_id: Option<String> = conn
        .query_row(
            "SELECT class_id FROM assignments WHERE id = ?",
            [assignment_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_query_err(req, e))?;
    let Some(class_id) = class_id else {
        return Err(err(&req.id, "not_found", "assignment not found", None));
    };
    let in_class: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
            (student_id, &class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_query_err(req, e))?;
    if in_class.is_none() {
        return Err(err(
            &req.id,
            "not_found",
            "student not found in the assignment's class",
            Some(json!({ "studentId": student_id })),
        ));
    }
    Ok(class_id)
}

fn handle_submissions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT s.id, s.student_id, st.name, s.grade, s.status, s.submitted_at
         FROM submissions s
         JOIN students st ON st.id = s.student_id
         WHERE s.assignment_id = ?
         ORDER BY st.sort_order, st.rowid",
    ) {
        Ok(s) => s,
        Err(e) => return db_query_err(req, e),
    };
    let rows = stmt
        .query_map([&assignment_id], |r| {
            let grade: Option<String> = r.get(3)?;
            let percent = Grade::parse(grade.as_deref()).percentage();
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "grade": grade,
                "gradePercent": percent,
                "status": r.get::<_, String>(4)?,
                "submittedAt": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(submissions) => ok(&req.id, json!({ "submissions": submissions })),
        Err(e) => db_query_err(req, e),
    }
}

fn handle_submissions_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = assignment_class_for_student(conn, req, &assignment_id, &student_id) {
        return e;
    }

    let submission_id = Uuid::new_v4().to_string();
    let submitted_at = now_rfc3339();
    match conn.execute(
        "INSERT INTO submissions(id, assignment_id, student_id, grade, status, submitted_at)
         VALUES(?, ?, ?, NULL, ?, ?)
         ON CONFLICT(assignment_id, student_id) DO NOTHING",
        (
            &submission_id,
            &assignment_id,
            &student_id,
            SubmissionStatus::Submitted.as_str(),
            &submitted_at,
        ),
    ) {
        Ok(0) => err(
            &req.id,
            "conflict",
            "student already submitted this assignment",
            None,
        ),
        Ok(_) => ok(
            &req.id,
            json!({
                "submissionId": submission_id,
                "status": SubmissionStatus::Submitted.as_str(),
                "submittedAt": submitted_at
            }),
        ),
        Err(e) => err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "submissions" })),
        ),
    }
}

/// Grading a student with no submission records one (work handed in on paper).
fn handle_submissions_grade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade = match req.params.get("grade") {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return err(&req.id, "bad_params", "grade must be a non-empty string or number", None),
    };
    if let Err(e) = assignment_class_for_student(conn, req, &assignment_id, &student_id) {
        return e;
    }

    if let Err(e) = conn.execute(
        "INSERT INTO submissions(id, assignment_id, student_id, grade, status, submitted_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(assignment_id, student_id) DO UPDATE SET
           grade = excluded.grade,
           status = excluded.status",
        (
            Uuid::new_v4().to_string(),
            &assignment_id,
            &student_id,
            &grade,
            SubmissionStatus::Graded.as_str(),
            now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "submissions" })),
        );
    }

    ok(
        &req.id,
        json!({
            "grade": grade,
            "gradePercent": grade_percentage(&grade),
            "status": SubmissionStatus::Graded.as_str()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.list" => Some(handle_assignments_list(state, req)),
        "assignments.create" => Some(handle_assignments_create(state, req)),
        "assignments.delete" => Some(handle_assignments_delete(state, req)),
        "submissions.list" => Some(handle_submissions_list(state, req)),
        "submissions.submit" => Some(handle_submissions_submit(state, req)),
        "submissions.grade" => Some(handle_submissions_grade(state, req)),
        _ => None,
    }
}
