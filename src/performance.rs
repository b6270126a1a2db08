use crate::autofill::SubmissionSnap;
use crate::calc::{CalcError, RosterStudent};
use crate::grades::Grade;
use crate::model::SubmissionStatus;
use rusqlite::Connection;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AssignmentSummary {
    pub id: String,
    pub title: String,
    pub subject: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentPerformance {
    pub student_id: String,
    pub name: String,
    pub average_percent: Option<f64>,
    pub graded_count: usize,
    pub pending_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentPerformance {
    pub assignment_id: String,
    pub title: String,
    pub subject: String,
    pub average_percent: Option<f64>,
    pub submission_count: usize,
    pub graded_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceModel {
    pub students: Vec<StudentPerformance>,
    pub assignments: Vec<AssignmentPerformance>,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Unparseable grades count as graded but contribute nothing to averages.
pub fn summarize_performance(
    roster: &[RosterStudent],
    assignments: &[AssignmentSummary],
    submissions: &[SubmissionSnap],
) -> PerformanceModel {
    let students = roster
        .iter()
        .map(|s| {
            let mine: Vec<&SubmissionSnap> = submissions
                .iter()
                .filter(|sub| sub.student_id == s.id)
                .collect();
            let pcts: Vec<f64> = mine
                .iter()
                .filter(|sub| sub.status == SubmissionStatus::Graded)
                .filter_map(|sub| Grade::parse(sub.grade.as_deref()).percentage())
                .collect();
            StudentPerformance {
                student_id: s.id.clone(),
                name: s.name.clone(),
                average_percent: mean(&pcts),
                graded_count: mine
                    .iter()
                    .filter(|sub| sub.status == SubmissionStatus::Graded)
                    .count(),
                pending_count: mine
                    .iter()
                    .filter(|sub| sub.status == SubmissionStatus::Submitted)
                    .count(),
            }
        })
        .collect();

    let assignments = assignments
        .iter()
        .map(|a| {
            let subs: Vec<&SubmissionSnap> = submissions
                .iter()
                .filter(|sub| sub.assignment_id == a.id)
                .collect();
            let graded: Vec<&&SubmissionSnap> = subs
                .iter()
                .filter(|sub| sub.status == SubmissionStatus::Graded)
                .collect();
            let pcts: Vec<f64> = graded
                .iter()
                .filter_map(|sub| Grade::parse(sub.grade.as_deref()).percentage())
                .collect();
            AssignmentPerformance {
                assignment_id: a.id.clone(),
                title: a.title.clone(),
                subject: a.subject.clone(),
                average_percent: mean(&pcts),
                submission_count: subs.len(),
                graded_count: graded.len(),
            }
        })
        .collect();

    PerformanceModel {
        students,
        assignments,
    }
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

pub fn load_assignments(
    conn: &Connection,
    class_id: &str,
    subject: Option<&str>,
) -> Result<Vec<AssignmentSummary>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, title, subject FROM assignments
             WHERE class_id = ?1 AND (?2 IS NULL OR subject = ?2)
             ORDER BY created_at, rowid",
        )
        .map_err(db_err)?;
    stmt.query_map((class_id, subject), |r| {
        Ok(AssignmentSummary {
            id: r.get(0)?,
            title: r.get(1)?,
            subject: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

pub fn load_submissions(
    conn: &Connection,
    class_id: &str,
    subject: Option<&str>,
) -> Result<Vec<SubmissionSnap>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.assignment_id, s.student_id, s.grade, s.status
             FROM submissions s
             JOIN assignments a ON a.id = s.assignment_id
             WHERE a.class_id = ?1 AND (?2 IS NULL OR a.subject = ?2)
             ORDER BY s.submitted_at, s.rowid",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map((class_id, subject), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(rows
        .into_iter()
        .filter_map(|(assignment_id, student_id, grade, status)| {
            SubmissionStatus::parse(&status).map(|status| SubmissionSnap {
                assignment_id,
                student_id,
                grade,
                status,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(a: &str, s: &str, grade: Option<&str>, status: SubmissionStatus) -> SubmissionSnap {
        SubmissionSnap {
            assignment_id: a.to_string(),
            student_id: s.to_string(),
            grade: grade.map(|g| g.to_string()),
            status,
        }
    }

    #[test]
    fn averages_skip_unparseable_and_pending() {
        let roster = vec![
            RosterStudent {
                id: "s1".into(),
                name: "Ama".into(),
            },
            RosterStudent {
                id: "s2".into(),
                name: "Kofi".into(),
            },
        ];
        let assignments = vec![
            AssignmentSummary {
                id: "a1".into(),
                title: "Fractions".into(),
                subject: "Maths".into(),
            },
            AssignmentSummary {
                id: "a2".into(),
                title: "Decimals".into(),
                subject: "Maths".into(),
            },
        ];
        let submissions = vec![
            sub("a1", "s1", Some("15/20"), SubmissionStatus::Graded),
            sub("a2", "s1", Some("B"), SubmissionStatus::Graded),
            sub("a1", "s2", Some("great work"), SubmissionStatus::Graded),
            sub("a2", "s2", None, SubmissionStatus::Submitted),
        ];
        let model = summarize_performance(&roster, &assignments, &submissions);

        assert_eq!(model.students[0].average_percent, Some(80.0));
        assert_eq!(model.students[0].graded_count, 2);
        assert_eq!(model.students[1].average_percent, None);
        assert_eq!(model.students[1].graded_count, 1);
        assert_eq!(model.students[1].pending_count, 1);

        assert_eq!(model.assignments[0].average_percent, Some(75.0));
        assert_eq!(model.assignments[0].graded_count, 2);
        assert_eq!(model.assignments[1].submission_count, 2);
        assert_eq!(model.assignments[1].graded_count, 1);
    }
}
