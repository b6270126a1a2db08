use crate::calc::CalcError;
use crate::model::AttendanceStatus;
use chrono::{Duration, NaiveDate};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone)]
pub struct AttendanceRecord {
    pub date: NaiveDate,
    pub class_id: String,
    pub roster: Vec<String>,
    pub statuses: BTreeMap<String, AttendanceStatus>,
}

impl AttendanceRecord {
    fn count(&self, status: AttendanceStatus) -> usize {
        self.statuses.values().filter(|s| **s == status).count()
    }
}

/// `{YYYY-MM-DD}_{classId}`
pub fn record_key(date: NaiveDate, class_id: &str) -> String {
    format!("{}_{}", date.format(DATE_FORMAT), class_id)
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

/// The reference date is passed in; nothing here reads the clock.
#[derive(Debug, Clone, Copy)]
pub struct AttendanceWindow {
    pub today: NaiveDate,
    pub days: i64,
}

impl AttendanceWindow {
    /// Saturates at the earliest representable date.
    pub fn start(&self) -> NaiveDate {
        Duration::try_days(self.days)
            .and_then(|d| self.today.checked_sub_signed(d))
            .unwrap_or(NaiveDate::MIN)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrendConfig {
    /// A trend is only classified with more points than this.
    pub min_points: usize,
    /// Half-average difference needed to leave `Stable`.
    pub band: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            min_points: 10,
            band: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Halves are `[0, ceil(n/2))` and `[floor(n/2), n)`; with an odd count the
/// middle point belongs to both.
pub fn classify_trend(series: &[f64], cfg: &TrendConfig) -> Trend {
    let n = series.len();
    if n <= cfg.min_points {
        return Trend::Stable;
    }
    let first_avg = mean(&series[..n.div_ceil(2)]);
    let second_avg = mean(&series[n / 2..]);
    if second_avg > first_avg + cfg.band {
        Trend::Improving
    } else if second_avg < first_avg - cfg.band {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayPoint {
    pub date: String,
    pub label: String,
    pub present: usize,
    pub total: usize,
    pub percentage: f64,
}

/// Day series ordered by ISO date. Records sharing a date are summed together.
pub fn day_series<'a, I>(records: I) -> Vec<DayPoint>
where
    I: IntoIterator<Item = &'a AttendanceRecord>,
{
    let mut by_day: BTreeMap<NaiveDate, (usize, usize)> = BTreeMap::new();
    for r in records {
        let e = by_day.entry(r.date).or_insert((0, 0));
        e.0 += r.count(AttendanceStatus::Present);
        e.1 += r.roster.len();
    }
    by_day
        .into_iter()
        .map(|(date, (present, total))| DayPoint {
            date: date.format(DATE_FORMAT).to_string(),
            label: date.format("%b %-d").to_string(),
            present,
            total,
            percentage: if total > 0 {
                (present as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassAttendance {
    pub class_id: String,
    pub average_attendance: f64,
    pub absences: usize,
    pub lates: usize,
    pub day_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAttendance {
    pub student_id: String,
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub recorded: usize,
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceAnalytics {
    pub window_start: String,
    pub today: String,
    pub days: Vec<DayPoint>,
    pub average_attendance: f64,
    pub trend: Trend,
    pub classes: Vec<ClassAttendance>,
    pub best_class: Option<String>,
    pub worst_class: Option<String>,
    pub students: Vec<StudentAttendance>,
}

pub fn analyze_attendance(
    records: &[AttendanceRecord],
    window: &AttendanceWindow,
    class_filter: Option<&str>,
    trend_cfg: &TrendConfig,
) -> AttendanceAnalytics {
    let in_window: Vec<&AttendanceRecord> = records
        .iter()
        .filter(|r| window.contains(r.date))
        .filter(|r| class_filter.map(|c| r.class_id == c).unwrap_or(true))
        .collect();

    let days = day_series(in_window.iter().copied());
    let percentages: Vec<f64> = days.iter().map(|d| d.percentage).collect();
    let average_attendance = mean(&percentages);
    let trend = classify_trend(&percentages, trend_cfg);

    let mut by_class: BTreeMap<&str, Vec<&AttendanceRecord>> = BTreeMap::new();
    for r in in_window.iter().copied() {
        by_class.entry(r.class_id.as_str()).or_default().push(r);
    }
    let classes: Vec<ClassAttendance> = by_class
        .into_iter()
        .map(|(class_id, recs)| {
            let class_days = day_series(recs.iter().copied());
            let pcts: Vec<f64> = class_days.iter().map(|d| d.percentage).collect();
            ClassAttendance {
                class_id: class_id.to_string(),
                average_attendance: mean(&pcts),
                absences: recs.iter().map(|r| r.count(AttendanceStatus::Absent)).sum(),
                lates: recs.iter().map(|r| r.count(AttendanceStatus::Late)).sum(),
                day_count: class_days.len(),
            }
        })
        .collect();

    let mut best: Option<&ClassAttendance> = None;
    let mut worst: Option<&ClassAttendance> = None;
    for c in &classes {
        if best.map_or(true, |b| c.average_attendance > b.average_attendance) {
            best = Some(c);
        }
        if worst.map_or(true, |w| c.average_attendance < w.average_attendance) {
            worst = Some(c);
        }
    }

    AttendanceAnalytics {
        window_start: window.start().format(DATE_FORMAT).to_string(),
        today: window.today.format(DATE_FORMAT).to_string(),
        average_attendance,
        trend,
        best_class: best.map(|c| c.class_id.clone()),
        worst_class: worst.map(|c| c.class_id.clone()),
        students: student_rollup(&in_window),
        classes,
        days,
    }
}

/// Lowest attendance rate first.
fn student_rollup(records: &[&AttendanceRecord]) -> Vec<StudentAttendance> {
    let mut by_student: BTreeMap<&str, StudentAttendance> = BTreeMap::new();
    for r in records {
        for (student_id, status) in &r.statuses {
            let e = by_student
                .entry(student_id.as_str())
                .or_insert_with(|| StudentAttendance {
                    student_id: student_id.clone(),
                    present: 0,
                    absent: 0,
                    late: 0,
                    recorded: 0,
                    rate: 0.0,
                });
            e.recorded += 1;
            match status {
                AttendanceStatus::Present => e.present += 1,
                AttendanceStatus::Absent => e.absent += 1,
                AttendanceStatus::Late => e.late += 1,
            }
        }
    }
    let mut out: Vec<StudentAttendance> = by_student
        .into_values()
        .map(|mut s| {
            s.rate = ((s.present + s.late) as f64 / s.recorded as f64) * 100.0;
            s
        })
        .collect();
    out.sort_by(|a, b| a.rate.total_cmp(&b.rate));
    out
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

/// Rows that fail to parse are skipped rather than failing the whole load.
pub fn load_records_since(
    conn: &Connection,
    since: NaiveDate,
    class_id: Option<&str>,
) -> Result<Vec<AttendanceRecord>, CalcError> {
    let since = since.format(DATE_FORMAT).to_string();
    let mut stmt = conn
        .prepare(
            "SELECT date, class_id, roster_json, statuses_json
             FROM attendance_records
             WHERE date >= ?1 AND (?2 IS NULL OR class_id = ?2)
             ORDER BY date, class_id",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map((&since, class_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut out = Vec::with_capacity(rows.len());
    for (date, class_id, roster_json, statuses_json) in rows {
        let Some(date) = parse_date(&date) else {
            tracing::warn!(%date, %class_id, "skipping attendance record with bad date");
            continue;
        };
        let roster: Vec<String> = serde_json::from_str(&roster_json).unwrap_or_default();
        let statuses = decode_statuses(&statuses_json);
        out.push(AttendanceRecord {
            date,
            class_id,
            roster,
            statuses,
        });
    }
    Ok(out)
}

/// Unknown status strings are dropped.
pub fn decode_statuses(raw: &str) -> BTreeMap<String, AttendanceStatus> {
    let parsed: BTreeMap<String, String> = serde_json::from_str(raw).unwrap_or_default();
    parsed
        .into_iter()
        .filter_map(|(k, v)| AttendanceStatus::parse(&v).map(|s| (k, s)))
        .collect()
}

pub fn encode_statuses(statuses: &BTreeMap<String, AttendanceStatus>) -> String {
    let plain: BTreeMap<&str, &str> = statuses
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    serde_json::to_string(&plain).unwrap_or_else(|_| "{}".to_string())
}
