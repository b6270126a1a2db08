//! Pre-populates class components from data teachers already entered:
//! graded assignment submissions feed `indivTest`, a graded group feeds
//! `groupWork`. `classTest` and `project` stay manual.

use crate::calc::{round_off_1_decimal, CalcError, ComponentScores, RosterStudent};
use crate::grades::Grade;
use crate::model::SubmissionStatus;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutofillConfig {
    /// Denominator assumed for bare-number grades.
    pub default_max_score: f64,
    /// Scale of one class component.
    pub component_max: f64,
}

impl Default for AutofillConfig {
    fn default() -> Self {
        Self {
            default_max_score: 20.0,
            component_max: 15.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmissionSnap {
    pub assignment_id: String,
    pub student_id: String,
    pub grade: Option<String>,
    pub status: SubmissionStatus,
}

#[derive(Debug, Clone)]
pub struct GroupSnap {
    pub members: Vec<String>,
    pub grade: Option<String>,
}

/// Everything the bridge reads for one class and subject.
#[derive(Debug, Clone, Default)]
pub struct AutofillSnapshot {
    pub assignment_ids: Vec<String>,
    pub submissions: Vec<SubmissionSnap>,
    pub groups: Vec<GroupSnap>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutofilledScores {
    pub indiv_test: Option<f64>,
    pub group_work: Option<f64>,
}

impl AutofilledScores {
    /// Overwrites whatever was entered for the two auto-filled components.
    pub fn apply(&self, scores: &mut ComponentScores) {
        if let Some(v) = self.indiv_test {
            scores.indiv_test = Some(v);
        }
        if let Some(v) = self.group_work {
            scores.group_work = Some(v);
        }
    }
}

pub fn autofill_components(
    roster: &[RosterStudent],
    snapshot: &AutofillSnapshot,
    cfg: &AutofillConfig,
) -> BTreeMap<String, AutofilledScores> {
    let mut graded: HashMap<(&str, &str), &SubmissionSnap> = HashMap::new();
    for s in &snapshot.submissions {
        if s.status == SubmissionStatus::Graded {
            graded.insert((s.assignment_id.as_str(), s.student_id.as_str()), s);
        }
    }

    let assignment_count = snapshot.assignment_ids.len();
    let mut out = BTreeMap::new();
    for student in roster {
        // Averaged over assignments, not submissions: a missing one counts as 0.
        let indiv_test = if assignment_count == 0 {
            None
        } else {
            let sum: f64 = snapshot
                .assignment_ids
                .iter()
                .filter_map(|aid| graded.get(&(aid.as_str(), student.id.as_str())))
                .filter_map(|s| Grade::parse(s.grade.as_deref()).score_ratio(cfg.default_max_score))
                .sum();
            Some(round_off_1_decimal(
                (sum / assignment_count as f64) * cfg.component_max,
            ))
        };

        let group_work = snapshot
            .groups
            .iter()
            .filter(|g| g.members.iter().any(|m| m == &student.id))
            .find_map(|g| match Grade::parse(g.grade.as_deref()) {
                Grade::Number(n) => Some(n),
                _ => None,
            });

        out.insert(
            student.id.clone(),
            AutofilledScores {
                indiv_test,
                group_work,
            },
        );
    }
    out
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

pub fn load_snapshot(
    conn: &Connection,
    class_id: &str,
    subject: &str,
) -> Result<AutofillSnapshot, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id FROM assignments
             WHERE class_id = ? AND subject = ?
             ORDER BY created_at, rowid",
        )
        .map_err(db_err)?;
    let assignment_ids = stmt
        .query_map((class_id, subject), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut stmt = conn
        .prepare(
            "SELECT s.assignment_id, s.student_id, s.grade, s.status
             FROM submissions s
             JOIN assignments a ON a.id = s.assignment_id
             WHERE a.class_id = ? AND a.subject = ?",
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
    let submissions = rows
        .into_iter()
        .filter_map(|(assignment_id, student_id, grade, status)| {
            // Unknown status strings are treated as not graded.
            SubmissionStatus::parse(&status).map(|status| SubmissionSnap {
                assignment_id,
                student_id,
                grade,
                status,
            })
        })
        .collect();

    let mut stmt = conn
        .prepare(
            "SELECT members_json, grade FROM work_groups
             WHERE class_id = ? AND (subject IS NULL OR subject = ?)
             ORDER BY created_at, rowid",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map((class_id, subject), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    let groups = rows
        .into_iter()
        .map(|(members_json, grade)| GroupSnap {
            members: serde_json::from_str(&members_json).unwrap_or_default(),
            grade,
        })
        .collect();

    Ok(AutofillSnapshot {
        assignment_ids,
        submissions,
        groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(id: &str) -> RosterStudent {
        RosterStudent {
            id: id.to_string(),
            name: id.to_uppercase(),
        }
    }

    fn graded(assignment: &str, student: &str, grade: &str) -> SubmissionSnap {
        SubmissionSnap {
            assignment_id: assignment.to_string(),
            student_id: student.to_string(),
            grade: Some(grade.to_string()),
            status: SubmissionStatus::Graded,
        }
    }

    #[test]
    fn indiv_test_averages_over_assignments() {
        let snapshot = AutofillSnapshot {
            assignment_ids: vec!["a1".into(), "a2".into()],
            submissions: vec![graded("a1", "s1", "15/20"), graded("a2", "s1", "10")],
            groups: vec![],
        };
        let out = autofill_components(&[student("s1")], &snapshot, &AutofillConfig::default());
        // (0.75 + 0.5) / 2 * 15
        assert_eq!(out["s1"].indiv_test, Some(9.4));
        assert_eq!(out["s1"].group_work, None);
    }

    #[test]
    fn missing_or_ungraded_submissions_count_as_zero() {
        let mut pending = graded("a2", "s1", "20/20");
        pending.status = SubmissionStatus::Submitted;
        let snapshot = AutofillSnapshot {
            assignment_ids: vec!["a1".into(), "a2".into(), "a3".into()],
            submissions: vec![graded("a1", "s1", "20/20"), pending, graded("a3", "s1", "B+")],
            groups: vec![],
        };
        let out = autofill_components(&[student("s1")], &snapshot, &AutofillConfig::default());
        assert_eq!(out["s1"].indiv_test, Some(5.0));
    }

    #[test]
    fn no_assignments_leaves_indiv_test_unset() {
        let out = autofill_components(
            &[student("s1")],
            &AutofillSnapshot::default(),
            &AutofillConfig::default(),
        );
        assert_eq!(out["s1"], AutofilledScores::default());
    }

    #[test]
    fn group_grade_fills_group_work_for_members() {
        let snapshot = AutofillSnapshot {
            assignment_ids: vec![],
            submissions: vec![],
            groups: vec![
                GroupSnap {
                    members: vec!["s1".into()],
                    grade: None,
                },
                GroupSnap {
                    members: vec!["s1".into(), "s2".into()],
                    grade: Some("12.5".into()),
                },
                GroupSnap {
                    members: vec!["s3".into()],
                    grade: Some("12/15".into()),
                },
            ],
        };
        let out = autofill_components(
            &[student("s1"), student("s2"), student("s3")],
            &snapshot,
            &AutofillConfig::default(),
        );
        assert_eq!(out["s1"].group_work, Some(12.5));
        assert_eq!(out["s2"].group_work, Some(12.5));
        assert_eq!(out["s3"].group_work, None);
    }

    #[test]
    fn apply_overwrites_only_filled_components() {
        let mut scores = ComponentScores {
            indiv_test: Some(1.0),
            group_work: Some(2.0),
            class_test: Some(3.0),
            project: Some(4.0),
            end_of_term_exams: Some(50.0),
        };
        AutofilledScores {
            indiv_test: Some(9.0),
            group_work: None,
        }
        .apply(&mut scores);
        assert_eq!(scores.indiv_test, Some(9.0));
        assert_eq!(scores.group_work, Some(2.0));
        assert_eq!(scores.class_test, Some(3.0));
        assert_eq!(scores.project, Some(4.0));
    }
}
