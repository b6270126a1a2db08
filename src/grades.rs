use serde::{Deserialize, Serialize};
use std::fmt;

/// A free-text grade as teachers type it into a submission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Grade {
    Unset,
    /// `score/max`, e.g. `15/20`.
    Fraction { score: f64, max: f64 },
    /// A bare number, already a percentage for display purposes.
    Number(f64),
    Letter { letter: char, plus: bool },
    /// Non-empty text that matches none of the forms above.
    Unrecognized,
}

impl Grade {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Grade::Unset;
        };
        let t = raw.trim();
        if t.is_empty() {
            return Grade::Unset;
        }

        // A malformed fraction falls through to the letter prefix match ("A/B" reads as A).
        if let Some((num, den)) = t.split_once('/') {
            if let (Ok(score), Ok(max)) = (num.trim().parse::<f64>(), den.trim().parse::<f64>()) {
                if score.is_finite() && max.is_finite() {
                    return Grade::Fraction { score, max };
                }
            }
        }

        if let Ok(n) = t.parse::<f64>() {
            if n.is_finite() {
                return Grade::Number(n);
            }
        }

        let upper = t.to_ascii_uppercase();
        match upper.chars().next() {
            Some(c @ ('A' | 'B' | 'C' | 'D' | 'F')) => Grade::Letter {
                letter: c,
                plus: upper[1..].starts_with('+'),
            },
            _ => Grade::Unrecognized,
        }
    }

    /// Percentage used in averages; `None` means "no contribution".
    pub fn percentage(&self) -> Option<f64> {
        match *self {
            Grade::Unset | Grade::Unrecognized => None,
            Grade::Fraction { score, max } => {
                if max > 0.0 {
                    Some((score / max) * 100.0)
                } else {
                    None
                }
            }
            Grade::Number(n) => Some(n),
            Grade::Letter { letter, .. } => match letter {
                'A' => Some(95.0),
                'B' => Some(85.0),
                'C' => Some(75.0),
                'D' => Some(65.0),
                'F' => Some(50.0),
                _ => None,
            },
        }
    }

    /// Fraction of full marks for the auto-fill bridge. Only the numeric forms
    /// count; a bare number is read as out of `default_max`.
    pub fn score_ratio(&self, default_max: f64) -> Option<f64> {
        match *self {
            Grade::Fraction { score, max } if max > 0.0 => Some(score / max),
            Grade::Number(n) if default_max > 0.0 => Some(n / default_max),
            _ => None,
        }
    }
}

pub fn grade_percentage(raw: &str) -> Option<f64> {
    Grade::parse(Some(raw)).percentage()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LetterGrade {
    A,
    #[serde(rename = "B+")]
    BPlus,
    B,
    #[serde(rename = "C+")]
    CPlus,
    C,
    #[serde(rename = "D+")]
    DPlus,
    D,
    F,
}

impl LetterGrade {
    pub fn as_str(self) -> &'static str {
        match self {
            LetterGrade::A => "A",
            LetterGrade::BPlus => "B+",
            LetterGrade::B => "B",
            LetterGrade::CPlus => "C+",
            LetterGrade::C => "C",
            LetterGrade::DPlus => "D+",
            LetterGrade::D => "D",
            LetterGrade::F => "F",
        }
    }
}

impl fmt::Display for LetterGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const GRADE_BANDS: [(f64, LetterGrade); 7] = [
    (80.0, LetterGrade::A),
    (70.0, LetterGrade::BPlus),
    (60.0, LetterGrade::B),
    (55.0, LetterGrade::CPlus),
    (50.0, LetterGrade::C),
    (45.0, LetterGrade::DPlus),
    (40.0, LetterGrade::D),
];

/// Highest band whose lower bound the total reaches.
pub fn grade_band(overall_total: f64) -> LetterGrade {
    for (min, grade) in GRADE_BANDS {
        if overall_total >= min {
            return grade;
        }
    }
    LetterGrade::F
}
