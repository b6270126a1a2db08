//! Workspace configuration, stored as JSON sections in the `settings` table and
//! merged over built-in defaults. Computations receive the typed views below
//! rather than reading settings themselves.

use crate::attendance::TrendConfig;
use crate::autofill::AutofillConfig;
use crate::db;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupSection {
    School,
    Attendance,
    Autofill,
}

impl SetupSection {
    pub const ALL: [SetupSection; 3] = [Self::School, Self::Attendance, Self::Autofill];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "school" => Some(Self::School),
            "attendance" => Some(Self::Attendance),
            "autofill" => Some(Self::Autofill),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::School => "school",
            Self::Attendance => "attendance",
            Self::Autofill => "autofill",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::School => "setup.school",
            Self::Attendance => "setup.attendance",
            Self::Autofill => "setup.autofill",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::School => json!({
            "schoolName": "",
            "academicYear": "2025/2026",
            "term": "Term 1"
        }),
        SetupSection::Attendance => json!({
            "windowDays": 30,
            "trendMinPoints": 10,
            "trendBand": 1.0
        }),
        SetupSection::Autofill => json!({
            "defaultMaxScore": 20.0,
            "componentMax": 15.0
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

/// Upper bound for the attendance look-back, stored or per request.
pub const MAX_WINDOW_DAYS: i64 = 365;

pub fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_non_empty(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = parse_string_max(v, key, max_len)?;
    if s.is_empty() {
        return Err(format!("{} must not be empty", key));
    }
    Ok(s)
}

pub fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::School => match k.as_str() {
                "schoolName" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "academicYear" | "term" => {
                    obj.insert(k.clone(), Value::String(parse_non_empty(v, k, 32)?));
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
            SetupSection::Attendance => match k.as_str() {
                "windowDays" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, MAX_WINDOW_DAYS)?));
                }
                "trendMinPoints" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 365)?));
                }
                "trendBand" => {
                    obj.insert(k.clone(), Value::from(parse_f64_range(v, k, 0.0, 100.0)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Autofill => match k.as_str() {
                "defaultMaxScore" => {
                    obj.insert(k.clone(), Value::from(parse_f64_range(v, k, 1.0, 1000.0)?));
                }
                "componentMax" => {
                    obj.insert(k.clone(), Value::from(parse_f64_range(v, k, 1.0, 100.0)?));
                }
                _ => return Err(format!("unknown autofill field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed stored values fall back to defaults instead of failing.
            if let Err(msg) = merge_section_patch(section, &mut current, saved_obj) {
                tracing::warn!(section = section.name(), %msg, "ignoring stored setup values");
                current = default_section(section);
            }
        }
    }
    Ok(current)
}

pub fn update_section(
    conn: &Connection,
    section: SetupSection,
    patch: &Map<String, Value>,
) -> anyhow::Result<Result<Value, String>> {
    let mut current = load_section(conn, section)?;
    if let Err(msg) = merge_section_patch(section, &mut current, patch) {
        return Ok(Err(msg));
    }
    db::settings_set_json(conn, section.key(), &current)?;
    Ok(Ok(current))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolSettings {
    pub school_name: String,
    pub academic_year: String,
    pub term: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttendanceSection {
    window_days: i64,
    trend_min_points: i64,
    trend_band: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct AttendanceSettings {
    pub window_days: i64,
    pub trend: TrendConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AutofillSection {
    default_max_score: f64,
    component_max: f64,
}

pub fn school_settings(conn: &Connection) -> anyhow::Result<SchoolSettings> {
    Ok(serde_json::from_value(load_section(conn, SetupSection::School)?)?)
}

pub fn attendance_settings(conn: &Connection) -> anyhow::Result<AttendanceSettings> {
    let s: AttendanceSection =
        serde_json::from_value(load_section(conn, SetupSection::Attendance)?)?;
    Ok(AttendanceSettings {
        window_days: s.window_days,
        trend: TrendConfig {
            min_points: s.trend_min_points.max(0) as usize,
            band: s.trend_band,
        },
    })
}

pub fn autofill_settings(conn: &Connection) -> anyhow::Result<AutofillConfig> {
    let s: AutofillSection = serde_json::from_value(load_section(conn, SetupSection::Autofill)?)?;
    Ok(AutofillConfig {
        default_max_score: s.default_max_score,
        component_max: s.component_max,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deserialize_into_typed_views() {
        let school: SchoolSettings =
            serde_json::from_value(default_section(SetupSection::School)).expect("school");
        assert_eq!(school.term, "Term 1");
        let autofill: AutofillSection =
            serde_json::from_value(default_section(SetupSection::Autofill)).expect("autofill");
        assert_eq!(autofill.default_max_score, 20.0);
        assert_eq!(autofill.component_max, 15.0);
    }

    #[test]
    fn patch_validates_fields() {
        let mut current = default_section(SetupSection::Attendance);
        let patch = json!({ "windowDays": 14 });
        merge_section_patch(
            SetupSection::Attendance,
            &mut current,
            patch.as_object().expect("object"),
        )
        .expect("valid patch");
        assert_eq!(current["windowDays"], 14);

        let bad = json!({ "windowDays": 0 });
        assert!(merge_section_patch(
            SetupSection::Attendance,
            &mut current,
            bad.as_object().expect("object")
        )
        .is_err());

        let unknown = json!({ "colour": "red" });
        assert!(merge_section_patch(
            SetupSection::School,
            &mut current,
            unknown.as_object().expect("object")
        )
        .is_err());
    }
}
