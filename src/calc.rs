use crate::autofill;
use crate::grades::{grade_band, LetterGrade};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// 1-decimal rounding applied when derived values are persisted:
/// `floor(10*x + 0.5) / 10`
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

pub const CLASS_SCORE_MAX: f64 = 60.0;
pub const EXAM_SCORE_MAX: f64 = 100.0;
pub const SCALED_HALF: f64 = 50.0;

/// Entered scores for one student in one subject. Ranges (0..=15 per class
/// component, 0..=100 for the exam) are not enforced here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentScores {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indiv_test: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_work: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_test: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_of_term_exams: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub total_class_score: f64,
    pub scaled_class_score: f64,
    pub scaled_exam_score: f64,
    pub overall_total: f64,
    pub grade: LetterGrade,
}

impl ScoreBreakdown {
    /// Values as they are stored; the grade stays the one derived at full precision.
    pub fn rounded(self) -> Self {
        Self {
            total_class_score: round_off_1_decimal(self.total_class_score),
            scaled_class_score: round_off_1_decimal(self.scaled_class_score),
            scaled_exam_score: round_off_1_decimal(self.scaled_exam_score),
            overall_total: round_off_1_decimal(self.overall_total),
            grade: self.grade,
        }
    }
}

/// Missing components count as zero.
pub fn aggregate_scores(scores: &ComponentScores) -> ScoreBreakdown {
    let total_class_score = scores.indiv_test.unwrap_or(0.0)
        + scores.group_work.unwrap_or(0.0)
        + scores.class_test.unwrap_or(0.0)
        + scores.project.unwrap_or(0.0);
    let scaled_class_score = (total_class_score / CLASS_SCORE_MAX) * SCALED_HALF;
    let scaled_exam_score = (scores.end_of_term_exams.unwrap_or(0.0) / EXAM_SCORE_MAX) * SCALED_HALF;
    let overall_total = scaled_class_score + scaled_exam_score;
    ScoreBreakdown {
        total_class_score,
        scaled_class_score,
        scaled_exam_score,
        overall_total,
        grade: grade_band(overall_total),
    }
}

/// Positions aligned with `totals`. Sorting is stable and descending; a total
/// equal to the one ranked directly above it shares that position, and the next
/// distinct total takes its own 1-based sort index (90, 85, 85, 70 -> 1, 2, 2, 4).
pub fn assign_positions(totals: &[f64]) -> Vec<u32> {
    let mut order: Vec<usize> = (0..totals.len()).collect();
    order.sort_by(|&a, &b| totals[b].total_cmp(&totals[a]));

    let mut positions = vec![0u32; totals.len()];
    for (rank_idx, &i) in order.iter().enumerate() {
        positions[i] = match rank_idx.checked_sub(1).map(|p| order[p]) {
            Some(prev) if totals[prev] == totals[i] => positions[prev],
            _ => rank_idx as u32 + 1,
        };
    }
    positions
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalReportMark {
    pub student_name: String,
    #[serde(flatten)]
    pub components: ComponentScores,
    pub total_class_score: f64,
    pub scaled_class_score: f64,
    pub scaled_exam_score: f64,
    pub overall_total: f64,
    pub grade: LetterGrade,
    pub position: u32,
}

/// One subject's mark table, keyed by student id. Sorted keys keep the
/// serialized form stable across recalculations.
pub type SubjectMarks = BTreeMap<String, TerminalReportMark>;

#[derive(Debug, Clone)]
pub struct RosterStudent {
    pub id: String,
    pub name: String,
}

/// Scores, rounds and ranks every roster student. Students without an entry
/// score zero on everything.
pub fn compute_subject_marks(
    roster: &[RosterStudent],
    entries: &HashMap<String, ComponentScores>,
) -> SubjectMarks {
    let rows: Vec<(ComponentScores, ScoreBreakdown)> = roster
        .iter()
        .map(|s| {
            let scores = entries.get(&s.id).copied().unwrap_or_default();
            (scores, aggregate_scores(&scores).rounded())
        })
        .collect();

    let totals: Vec<f64> = rows.iter().map(|(_, b)| b.overall_total).collect();
    let positions = assign_positions(&totals);

    roster
        .iter()
        .zip(rows)
        .zip(positions)
        .map(|((student, (components, b)), position)| {
            (
                student.id.clone(),
                TerminalReportMark {
                    student_name: student.name.clone(),
                    components,
                    total_class_score: b.total_class_score,
                    scaled_class_score: b.scaled_class_score,
                    scaled_exam_score: b.scaled_exam_score,
                    overall_total: b.overall_total,
                    grade: b.grade,
                    position,
                },
            )
        })
        .collect()
}

/// Document key for a class/term report: `{academicYear}_{term}_{classId}` with
/// slashes in the academic year replaced by dashes.
pub fn report_key(academic_year: &str, term: &str, class_id: &str) -> String {
    format!("{}_{}_{}", academic_year.replace('/', "-"), term, class_id)
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

#[derive(Debug, Clone)]
pub struct ReportScope {
    pub academic_year: String,
    pub term: String,
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub class_id: &'a str,
    pub subject: &'a str,
    pub scope: &'a ReportScope,
}

impl CalcContext<'_> {
    pub fn report_key(&self) -> String {
        report_key(&self.scope.academic_year, &self.scope.term, self.class_id)
    }
}

pub fn load_roster(conn: &Connection, class_id: &str) -> Result<Vec<RosterStudent>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order, rowid",
        )
        .map_err(db_err)?;
    stmt.query_map([class_id], |r| {
        Ok(RosterStudent {
            id: r.get(0)?,
            name: r.get(1)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

fn ensure_class(conn: &Connection, class_id: &str) -> Result<(), CalcError> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| r.get(0))
        .optional()
        .map_err(db_err)?;
    match exists {
        Some(_) => Ok(()),
        None => Err(CalcError::new("not_found", "class not found")),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSubject {
    pub report_key: String,
    pub subject: String,
    pub autofilled: bool,
    pub marks: SubjectMarks,
}

/// "Calculate & Save": optional auto-fill, aggregate, round, rank, then upsert
/// this subject's table under the report key. Other subjects in the same report
/// are untouched. Same-subject writers are last-write-wins.
pub fn calculate_and_save(
    ctx: &CalcContext<'_>,
    mut entries: HashMap<String, ComponentScores>,
    autofill_cfg: Option<&autofill::AutofillConfig>,
) -> Result<SavedSubject, CalcError> {
    ensure_class(ctx.conn, ctx.class_id)?;
    let roster = load_roster(ctx.conn, ctx.class_id)?;

    if let Some(unknown) = entries
        .keys()
        .find(|id| !roster.iter().any(|s| &s.id == *id))
    {
        return Err(CalcError::new("bad_params", "entry for a student not in this class")
            .with_details(serde_json::json!({ "studentId": unknown })));
    }

    if let Some(cfg) = autofill_cfg {
        let snapshot = autofill::load_snapshot(ctx.conn, ctx.class_id, ctx.subject)?;
        let filled = autofill::autofill_components(&roster, &snapshot, cfg);
        for (student_id, f) in filled {
            f.apply(entries.entry(student_id).or_default());
        }
    }

    let marks = compute_subject_marks(&roster, &entries);
    let key = ctx.report_key();
    save_subject_marks(ctx, &key, &marks)?;

    Ok(SavedSubject {
        report_key: key,
        subject: ctx.subject.to_string(),
        autofilled: autofill_cfg.is_some(),
        marks,
    })
}

fn save_subject_marks(
    ctx: &CalcContext<'_>,
    key: &str,
    marks: &SubjectMarks,
) -> Result<(), CalcError> {
    let marks_json = serde_json::to_string(marks)
        .map_err(|e| CalcError::new("serialize_failed", e.to_string()))?;
    let now = chrono::Utc::now().to_rfc3339();

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO terminal_reports(id, academic_year, term, class_id, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        (
            key,
            &ctx.scope.academic_year,
            &ctx.scope.term,
            ctx.class_id,
            &now,
        ),
    )
    .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO terminal_report_subjects(report_id, subject, marks_json, updated_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(report_id, subject) DO UPDATE SET
           marks_json = excluded.marks_json,
           updated_at = excluded.updated_at",
        (key, ctx.subject, &marks_json, &now),
    )
    .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalReport {
    pub id: String,
    pub academic_year: String,
    pub term: String,
    pub class_id: String,
    pub updated_at: Option<String>,
    pub subjects: BTreeMap<String, SubjectMarks>,
}

/// Stored values are returned as persisted; nothing is recomputed on load.
pub fn load_report(conn: &Connection, key: &str) -> Result<Option<TerminalReport>, CalcError> {
    let head: Option<(String, String, String, Option<String>)> = conn
        .query_row(
            "SELECT academic_year, term, class_id, updated_at FROM terminal_reports WHERE id = ?",
            [key],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((academic_year, term, class_id, updated_at)) = head else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT subject, marks_json FROM terminal_report_subjects
             WHERE report_id = ?
             ORDER BY subject",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([key], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut subjects = BTreeMap::new();
    for (subject, marks_json) in rows {
        let marks: SubjectMarks = serde_json::from_str(&marks_json).map_err(|e| {
            CalcError::new("corrupt_report", e.to_string())
                .with_details(serde_json::json!({ "subject": subject }))
        })?;
        subjects.insert(subject, marks);
    }

    Ok(Some(TerminalReport {
        id: key.to_string(),
        academic_year,
        term,
        class_id,
        updated_at,
        subjects,
    }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentCardRow {
    pub subject: String,
    #[serde(flatten)]
    pub mark: TerminalReportMark,
    pub class_size: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentCard {
    pub report_key: String,
    pub student_id: String,
    pub student_name: Option<String>,
    pub subjects: Vec<StudentCardRow>,
    pub average_overall: Option<f64>,
}

/// One student's rows across every saved subject of a report.
pub fn student_card(report: &TerminalReport, student_id: &str) -> StudentCard {
    let subjects: Vec<StudentCardRow> = report
        .subjects
        .iter()
        .filter_map(|(subject, marks)| {
            marks.get(student_id).map(|m| StudentCardRow {
                subject: subject.clone(),
                mark: m.clone(),
                class_size: marks.len(),
            })
        })
        .collect();

    let average_overall = if subjects.is_empty() {
        None
    } else {
        let sum: f64 = subjects.iter().map(|r| r.mark.overall_total).sum();
        Some(round_off_1_decimal(sum / subjects.len() as f64))
    };

    StudentCard {
        report_key: report.id.clone(),
        student_id: student_id.to_string(),
        student_name: subjects.first().map(|r| r.mark.student_name.clone()),
        subjects,
        average_overall,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(ids: &[&str]) -> Vec<RosterStudent> {
        ids.iter()
            .map(|id| RosterStudent {
                id: id.to_string(),
                name: format!("Student {}", id),
            })
            .collect()
    }

    fn exam_only(exam: f64) -> ComponentScores {
        ComponentScores {
            end_of_term_exams: Some(exam),
            ..Default::default()
        }
    }

    #[test]
    fn round_off_half_up() {
        assert_eq!(round_off_1_decimal(0.0), 0.0);
        assert_eq!(round_off_1_decimal(3.54), 3.5);
        assert_eq!(round_off_1_decimal(3.55), 3.6);
        assert_eq!(round_off_1_decimal(35.6818), 35.7);
    }

    #[test]
    fn aggregate_matches_reference_example() {
        let b = aggregate_scores(&ComponentScores {
            indiv_test: Some(12.0),
            group_work: Some(10.0),
            class_test: Some(8.0),
            project: Some(9.0),
            end_of_term_exams: Some(70.0),
        });
        assert_eq!(b.total_class_score, 39.0);
        assert_eq!(b.scaled_class_score, 32.5);
        assert_eq!(b.scaled_exam_score, 35.0);
        assert_eq!(b.overall_total, 67.5);
        assert_eq!(b.grade, LetterGrade::B);
    }

    #[test]
    fn missing_components_count_as_zero() {
        let b = aggregate_scores(&ComponentScores::default());
        assert_eq!(b.overall_total, 0.0);
        assert_eq!(b.grade, LetterGrade::F);

        let b = aggregate_scores(&exam_only(100.0));
        assert_eq!(b.total_class_score, 0.0);
        assert_eq!(b.overall_total, 50.0);
        assert_eq!(b.grade, LetterGrade::C);
    }

    #[test]
    fn out_of_range_components_are_accepted() {
        let b = aggregate_scores(&ComponentScores {
            indiv_test: Some(30.0),
            ..Default::default()
        });
        assert_eq!(b.total_class_score, 30.0);
        assert_eq!(b.scaled_class_score, 25.0);
    }

    #[test]
    fn positions_share_rank_and_skip() {
        assert_eq!(assign_positions(&[90.0, 85.0, 85.0, 70.0]), vec![1, 2, 2, 4]);
        assert_eq!(assign_positions(&[70.0, 85.0, 90.0, 85.0]), vec![4, 2, 1, 2]);
        assert_eq!(assign_positions(&[50.0, 50.0, 50.0]), vec![1, 1, 1]);
        assert_eq!(assign_positions(&[]), Vec::<u32>::new());
    }

    #[test]
    fn positions_compare_only_with_previous() {
        assert_eq!(
            assign_positions(&[60.0, 60.0, 40.0, 40.0, 40.0, 10.0]),
            vec![1, 1, 3, 3, 3, 6]
        );
    }

    #[test]
    fn rounding_can_create_ties() {
        // 60.04 and 59.96 are distinct until both round to 60.0
        let mut entries = HashMap::new();
        entries.insert("a".to_string(), exam_only(120.08));
        entries.insert("b".to_string(), exam_only(119.92));
        entries.insert("c".to_string(), exam_only(10.0));
        let marks = compute_subject_marks(&roster(&["a", "b", "c"]), &entries);
        assert_eq!(marks["a"].overall_total, 60.0);
        assert_eq!(marks["b"].overall_total, 60.0);
        assert_eq!(marks["a"].position, 1);
        assert_eq!(marks["b"].position, 1);
        assert_eq!(marks["c"].position, 3);
        // grade comes from the unrounded total
        assert_eq!(marks["a"].grade, LetterGrade::B);
        assert_eq!(marks["b"].grade, LetterGrade::CPlus);
    }

    #[test]
    fn compute_subject_marks_covers_full_roster() {
        let mut entries = HashMap::new();
        entries.insert("a".to_string(), exam_only(80.0));
        let marks = compute_subject_marks(&roster(&["a", "b"]), &entries);
        assert_eq!(marks.len(), 2);
        assert_eq!(marks["b"].overall_total, 0.0);
        assert_eq!(marks["b"].position, 2);
        assert_eq!(marks["b"].components, ComponentScores::default());
    }

    #[test]
    fn mark_serializes_with_optional_inputs_omitted() {
        let mut entries = HashMap::new();
        entries.insert("a".to_string(), exam_only(70.0));
        let marks = compute_subject_marks(&roster(&["a"]), &entries);
        let v = serde_json::to_value(&marks["a"]).expect("serialize mark");
        assert_eq!(v["endOfTermExams"], 70.0);
        assert!(v.get("indivTest").is_none());
        assert_eq!(v["scaledExamScore"], 35.0);
        assert_eq!(v["grade"], "F");
        assert_eq!(v["position"], 1);

        let back: TerminalReportMark = serde_json::from_value(v).expect("deserialize mark");
        assert_eq!(back, marks["a"]);
    }

    #[test]
    fn report_key_replaces_year_slashes() {
        assert_eq!(report_key("2024/2025", "Term 2", "c1"), "2024-2025_Term 2_c1");
    }
}
