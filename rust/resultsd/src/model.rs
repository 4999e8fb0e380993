use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

pub const SOL_ROLL_NO_LEN: usize = 14;
pub const EXAM_ROLL_NO_LEN: usize = 12;
pub const DEFAULT_PASS_PERCENT: f64 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub code: String,
    pub name: String,
    pub max_marks: u32,
    pub marks_obtained: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PassStatus>,
}

impl SubjectResult {
    /// Explicit status from the sheet, else derived from the pass threshold.
    pub fn effective_status(&self, pass_percent: f64) -> PassStatus {
        if let Some(s) = self.status {
            return s;
        }
        if self.max_marks == 0 {
            return PassStatus::Fail;
        }
        let pct = 100.0 * (self.marks_obtained as f64) / (self.max_marks as f64);
        if pct >= pass_percent {
            PassStatus::Pass
        } else {
            PassStatus::Fail
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    pub sol_roll_no: String,
    pub exam_roll_no: String,
    pub name: String,
    pub course: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semester: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default)]
    pub subjects: Vec<SubjectResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBatch {
    pub id: String,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
    /// Declared record count; kept even when `student_records` is empty.
    pub records: usize,
    pub status: BatchStatus,
    #[serde(default)]
    pub batch_name: String,
    #[serde(default)]
    pub course_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub student_records: Vec<StudentRecord>,
}

impl UploadBatch {
    /// History view of a batch: everything except the contributed records.
    pub fn summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "filename": self.filename,
            "uploadedAt": self.uploaded_at.to_rfc3339(),
            "records": self.records,
            "status": self.status,
            "batchName": self.batch_name,
            "courseType": self.course_type,
            "sha256": self.sha256,
            "message": self.message,
        })
    }
}

/// Identifier (SOL or exam roll number) to record.
///
/// Stored on the wire as a sequence of `[identifier, record]` pairs so the
/// layout stays readable by clients that have no native map type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Index(BTreeMap<String, StudentRecord>);

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert under both identifiers, overwriting whatever was there.
    pub fn insert_record(&mut self, record: &StudentRecord) {
        self.0.insert(record.sol_roll_no.clone(), record.clone());
        self.0.insert(record.exam_roll_no.clone(), record.clone());
    }

    pub fn get(&self, identifier: &str) -> Option<&StudentRecord> {
        self.0.get(identifier)
    }

    #[allow(dead_code)]
    pub fn contains(&self, identifier: &str) -> bool {
        self.0.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Index {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

impl<'de> Deserialize<'de> for Index {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(String, StudentRecord)>::deserialize(deserializer)?;
        Ok(Index(pairs.into_iter().collect()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub total_max_marks: u64,
    pub total_marks_obtained: i64,
    /// Two decimals, as printed on the result sheet.
    pub percentage: String,
    pub overall_status: &'static str,
    pub subject_statuses: Vec<PassStatus>,
}

pub fn summarize(record: &StudentRecord, pass_percent: f64) -> ResultSummary {
    let total_max_marks: u64 = record.subjects.iter().map(|s| s.max_marks as u64).sum();
    let total_marks_obtained: i64 = record.subjects.iter().map(|s| s.marks_obtained).sum();
    let percentage = if total_max_marks > 0 {
        format!(
            "{:.2}",
            100.0 * (total_marks_obtained as f64) / (total_max_marks as f64)
        )
    } else {
        "0.00".to_string()
    };
    let subject_statuses: Vec<PassStatus> = record
        .subjects
        .iter()
        .map(|s| s.effective_status(pass_percent))
        .collect();
    let overall_status = if subject_statuses.iter().all(|s| *s == PassStatus::Pass) {
        "PASS"
    } else {
        "FAIL"
    };
    ResultSummary {
        total_max_marks,
        total_marks_obtained,
        percentage,
        overall_status,
        subject_statuses,
    }
}

/// Reformat whatever the user typed into the `00-0-00-000000` layout,
/// using only its digits. Partial input yields a partial layout.
pub fn format_sol_roll_no(input: &str) -> String {
    let digits: String = input.chars().filter(|c| c.is_ascii_digit()).collect();
    let n = digits.len();
    if n <= 2 {
        digits
    } else if n <= 3 {
        format!("{}-{}", &digits[..2], &digits[2..])
    } else if n <= 5 {
        format!("{}-{}-{}", &digits[..2], &digits[2..3], &digits[3..])
    } else {
        let end = n.min(11);
        format!(
            "{}-{}-{}-{}",
            &digits[..2],
            &digits[2..3],
            &digits[3..5],
            &digits[5..end]
        )
    }
}

pub fn is_valid_sol_roll_no(s: &str) -> bool {
    let b = s.as_bytes();
    if b.len() != SOL_ROLL_NO_LEN {
        return false;
    }
    b.iter().enumerate().all(|(i, ch)| match i {
        2 | 4 | 7 => *ch == b'-',
        _ => ch.is_ascii_digit(),
    })
}

pub fn exam_roll_digits(input: &str) -> String {
    input.chars().filter(|c| c.is_ascii_digit()).collect()
}

pub fn is_valid_exam_roll_no(s: &str) -> bool {
    s.len() == EXAM_ROLL_NO_LEN && s.bytes().all(|b| b.is_ascii_digit())
}
