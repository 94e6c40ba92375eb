use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholders Moodle shows while a grade is not computed yet.
pub const NOISE_VALUES: [&str; 2] = ["Error", "-"];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Course {
    pub id: i64,
    pub fullname: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub grades: Vec<GradeReport>,
}

impl Course {
    pub fn summary(&self) -> CourseSummary {
        CourseSummary {
            id: self.id,
            fullname: self.fullname.clone(),
        }
    }
}

/// Course identity carried by a change, without its grade table.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct CourseSummary {
    pub id: i64,
    pub fullname: String,
}

/// One row of a course grade table.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct GradeReport {
    pub id: i64,
    pub title: String,
    pub grade: String,
    pub percentage: String,
    pub feedback: String,
    pub contribution: String,
    pub range: String,
    pub weight: String,
}

impl GradeReport {
    pub fn field(&self, field: GradeField) -> &str {
        match field {
            GradeField::Title => &self.title,
            GradeField::Grade => &self.grade,
            GradeField::Percentage => &self.percentage,
            GradeField::Feedback => &self.feedback,
            GradeField::Contribution => &self.contribution,
            GradeField::Range => &self.range,
            GradeField::Weight => &self.weight,
        }
    }
}

/// The descriptive columns of a [`GradeReport`], in table order.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GradeField {
    Title,
    Grade,
    Percentage,
    Feedback,
    Contribution,
    Range,
    Weight,
}

impl GradeField {
    pub const ALL: [GradeField; 7] = [
        GradeField::Title,
        GradeField::Grade,
        GradeField::Percentage,
        GradeField::Feedback,
        GradeField::Contribution,
        GradeField::Range,
        GradeField::Weight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GradeField::Title => "Title",
            GradeField::Grade => "Grade",
            GradeField::Percentage => "Percentage",
            GradeField::Feedback => "Feedback",
            GradeField::Contribution => "Contribution",
            GradeField::Range => "Range",
            GradeField::Weight => "Weight",
        }
    }
}

impl fmt::Display for GradeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GradeField {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        GradeField::ALL
            .into_iter()
            .find(|field| field.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow!("unknown grade field {:?}", s))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Removed,
    Updated,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GradeRowChange {
    pub id: i64,
    pub kind: ChangeKind,
    /// Meaningfully changed fields; empty unless `kind` is `Updated`.
    pub fields: Vec<GradeField>,
    pub from: GradeReport,
    pub to: GradeReport,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CourseGradesChange {
    pub course: CourseSummary,
    pub grades_table_change: Vec<GradeRowChange>,
}

pub type ChangeSet = Vec<CourseGradesChange>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub updates: ChangeSet,
}
