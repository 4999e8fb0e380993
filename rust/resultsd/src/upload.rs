use crate::error::{Result, ResultsError};
use crate::model::{
    exam_roll_digits, format_sol_roll_no, is_valid_exam_roll_no, is_valid_sol_roll_no,
    BatchStatus, PassStatus, StudentRecord, SubjectResult, UploadBatch,
};
use calamine::{open_workbook_auto, DataType, Reader};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const WORKBOOK_EXTENSIONS: &[&str] = &["xlsx", "xls", "xlsm", "ods"];
const PROGRESS_STEPS: u8 = 10;
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// One data row of an uploaded sheet, keyed by the sheet's own header text.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// 1-based line (CSV) or row (workbook) number in the source file.
    pub line: usize,
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadWarning {
    pub line: usize,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct RecordBuild {
    pub records: Vec<StudentRecord>,
    pub warnings: Vec<UploadWarning>,
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub fn is_supported_file(path: &Path) -> bool {
    match extension_of(path) {
        Some(ext) => ext == "csv" || WORKBOOK_EXTENSIONS.contains(&ext.as_str()),
        None => false,
    }
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                buf.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => out.push(std::mem::take(&mut buf)),
            _ => buf.push(ch),
        }
    }
    out.push(buf);
    out
}

/// Pair a header row with data rows, skipping rows with no content.
fn rows_from_grid(grid: Vec<(usize, Vec<String>)>) -> Vec<Row> {
    let mut iter = grid
        .into_iter()
        .filter(|(_, cells)| cells.iter().any(|c| !c.trim().is_empty()));
    let Some((_, headers)) = iter.next() else {
        return Vec::new();
    };
    let headers: Vec<String> = headers.into_iter().map(|h| h.trim().to_string()).collect();
    iter.map(|(line, cells)| Row {
        line,
        fields: headers
            .iter()
            .cloned()
            .zip(cells.into_iter().chain(std::iter::repeat(String::new())))
            .collect(),
    })
    .collect()
}

fn read_csv_rows(text: &str) -> Vec<Row> {
    let text = text.trim_start_matches('\u{feff}');
    let grid = text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, parse_csv_record(line.trim_end_matches('\r'))))
        .collect();
    rows_from_grid(grid)
}

fn read_workbook_rows(path: &Path) -> Result<Vec<Row>> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| ResultsError::UploadParse(format!("could not open spreadsheet: {e}")))?;
    let Some(sheet) = workbook.sheet_names().first().cloned() else {
        return Err(ResultsError::UploadParse("spreadsheet has no sheets".into()));
    };
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| ResultsError::UploadParse(format!("could not read sheet {sheet}: {e}")))?;
    let first_row = range.start().map(|(r, _)| r as usize).unwrap_or(0);
    let grid = range
        .rows()
        .enumerate()
        .map(|(i, row)| {
            let cells = row
                .iter()
                .map(|c| c.as_string().unwrap_or_default())
                .collect();
            (first_row + i + 1, cells)
        })
        .collect();
    Ok(rows_from_grid(grid))
}

/// Read the sheet behind `path` into header-keyed rows.
pub fn read_rows(path: &Path) -> Result<Vec<Row>> {
    let Some(ext) = extension_of(path).filter(|_| is_supported_file(path)) else {
        return Err(ResultsError::UploadParse(
            "unsupported file type; upload .xlsx, .xls or .csv".into(),
        ));
    };
    if ext == "csv" {
        let text = std::fs::read_to_string(path)?;
        Ok(read_csv_rows(&text))
    } else {
        read_workbook_rows(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Column {
    Name,
    SolRollNo,
    ExamRollNo,
    Course,
    Semester,
    Session,
    SubjectCode,
    SubjectName,
    MaxMarks,
    MarksObtained,
    Status,
}

const REQUIRED: &[(Column, &str)] = &[
    (Column::Name, "Student Name"),
    (Column::SolRollNo, "SOL Roll No"),
    (Column::ExamRollNo, "Exam Roll No"),
    (Column::SubjectCode, "Subject Code"),
    (Column::MaxMarks, "Max Marks"),
    (Column::MarksObtained, "Marks Obtained"),
];

fn normalize_header(h: &str) -> String {
    h.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn column_for(header: &str) -> Option<Column> {
    let col = match normalize_header(header).as_str() {
        "studentname" | "name" => Column::Name,
        "solrollno" | "solrollnumber" | "solroll" => Column::SolRollNo,
        "examrollno" | "examrollnumber" | "examroll" => Column::ExamRollNo,
        "course" | "coursename" | "program" | "programme" => Column::Course,
        "semester" | "sem" => Column::Semester,
        "session" => Column::Session,
        "subjectcode" | "coursecode" | "papercode" | "code" => Column::SubjectCode,
        "subjectname" | "papername" | "subject" => Column::SubjectName,
        "maxmarks" | "maximummarks" | "max" => Column::MaxMarks,
        "marksobtained" | "obtainedmarks" | "marks" | "obtained" => Column::MarksObtained,
        "status" | "result" => Column::Status,
        _ => return None,
    };
    Some(col)
}

/// Sheet cells must already use the `00-0-00-000000` layout; bare digits are
/// reformatted only when there are exactly eleven of them.
fn sheet_sol_roll_no(cell: &str) -> Option<String> {
    let cell = cell.trim();
    if is_valid_sol_roll_no(cell) {
        return Some(cell.to_string());
    }
    if cell.len() == 11 && cell.bytes().all(|b| b.is_ascii_digit()) {
        return Some(format_sol_roll_no(cell));
    }
    None
}

/// Whole numbers only; spreadsheet cells often carry `78.0`.
fn parse_whole(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(v) = s.parse::<i64>() {
        return Some(v);
    }
    let f = s.parse::<f64>().ok()?;
    if f.is_finite() && f.fract() == 0.0 {
        Some(f as i64)
    } else {
        None
    }
}

fn parse_status(s: &str) -> Option<PassStatus> {
    match s.trim().to_ascii_lowercase().as_str() {
        "pass" | "p" | "passed" => Some(PassStatus::Pass),
        "fail" | "f" | "failed" => Some(PassStatus::Fail),
        _ => None,
    }
}

struct RowView<'a> {
    row: &'a Row,
    columns: &'a HashMap<Column, usize>,
}

impl RowView<'_> {
    fn get(&self, col: Column) -> &str {
        self.columns
            .get(&col)
            .and_then(|i| self.row.fields.get(*i))
            .map(|(_, v)| v.trim())
            .unwrap_or("")
    }

    fn opt(&self, col: Column) -> Option<String> {
        Some(self.get(col).to_string()).filter(|s| !s.is_empty())
    }
}

/// Turn rows (one subject per row) into student records, grouped by SOL roll
/// number in first-appearance order. Bad rows are skipped with a warning;
/// only a missing required column or an empty result fails the upload.
pub fn build_records(rows: &[Row], default_course: &str, pass_percent: f64) -> Result<RecordBuild> {
    let Some(first) = rows.first() else {
        return Err(ResultsError::UploadParse("file contains no data rows".into()));
    };
    let mut columns: HashMap<Column, usize> = HashMap::new();
    for (i, (header, _)) in first.fields.iter().enumerate() {
        if let Some(col) = column_for(header) {
            columns.entry(col).or_insert(i);
        }
    }
    let missing: Vec<&str> = REQUIRED
        .iter()
        .filter(|(col, _)| !columns.contains_key(col))
        .map(|(_, label)| *label)
        .collect();
    if !missing.is_empty() {
        return Err(ResultsError::UploadParse(format!(
            "missing required columns: {}",
            missing.join(", ")
        )));
    }

    let mut out = RecordBuild::default();
    let mut by_sol: HashMap<String, usize> = HashMap::new();
    let mut exam_owner: HashMap<String, String> = HashMap::new();

    for row in rows {
        let v = RowView {
            row,
            columns: &columns,
        };
        let mut warn_row = |code: &'static str, message: String| {
            out.warnings.push(UploadWarning {
                line: row.line,
                code,
                message,
            });
        };

        let Some(sol) = sheet_sol_roll_no(v.get(Column::SolRollNo)) else {
            warn_row(
                "bad_sol_roll_no",
                format!("invalid SOL Roll No {:?}", v.get(Column::SolRollNo)),
            );
            continue;
        };
        let exam = exam_roll_digits(v.get(Column::ExamRollNo));
        if !is_valid_exam_roll_no(&exam) {
            warn_row(
                "bad_exam_roll_no",
                format!("invalid Exam Roll No {:?}", v.get(Column::ExamRollNo)),
            );
            continue;
        }
        if let Some(owner) = exam_owner.get(&exam) {
            if *owner != sol {
                warn_row(
                    "duplicate_exam_roll_no",
                    format!("Exam Roll No {exam} already belongs to {owner}"),
                );
                continue;
            }
        }
        let code = v.get(Column::SubjectCode).to_string();
        if code.is_empty() {
            warn_row("missing_subject_code", "subject code is empty".into());
            continue;
        }
        let max_marks = match parse_whole(v.get(Column::MaxMarks)) {
            Some(m) if m > 0 && m <= u32::MAX as i64 => m as u32,
            _ => {
                warn_row(
                    "bad_max_marks",
                    "max marks must be a positive whole number".into(),
                );
                continue;
            }
        };
        let Some(marks_obtained) = parse_whole(v.get(Column::MarksObtained)) else {
            warn_row(
                "bad_marks_obtained",
                "marks obtained must be a whole number".into(),
            );
            continue;
        };
        if marks_obtained < 0 || marks_obtained > max_marks as i64 {
            warn_row(
                "marks_out_of_range",
                format!("marks obtained {marks_obtained} outside 0..={max_marks}"),
            );
        }

        let mut subject = SubjectResult {
            name: v.opt(Column::SubjectName).unwrap_or_else(|| code.clone()),
            code,
            max_marks,
            marks_obtained,
            status: parse_status(v.get(Column::Status)),
        };
        subject.status = Some(subject.effective_status(pass_percent));

        match by_sol.get(&sol) {
            Some(&idx) => {
                let record = &mut out.records[idx];
                if record.exam_roll_no != exam {
                    let message = format!(
                        "Exam Roll No {exam} conflicts with {} for {sol}",
                        record.exam_roll_no
                    );
                    out.warnings.push(UploadWarning {
                        line: row.line,
                        code: "conflicting_exam_roll_no",
                        message,
                    });
                    continue;
                }
                if record.subjects.iter().any(|s| s.code == subject.code) {
                    let message = format!("duplicate subject {} for {sol}", subject.code);
                    out.warnings.push(UploadWarning {
                        line: row.line,
                        code: "duplicate_subject",
                        message,
                    });
                    continue;
                }
                record.subjects.push(subject);
            }
            None => {
                let Some(name) = v.opt(Column::Name) else {
                    warn_row("missing_name", "student name is empty".into());
                    continue;
                };
                exam_owner.insert(exam.clone(), sol.clone());
                by_sol.insert(sol.clone(), out.records.len());
                out.records.push(StudentRecord {
                    sol_roll_no: sol,
                    exam_roll_no: exam,
                    name,
                    course: v
                        .opt(Column::Course)
                        .unwrap_or_else(|| default_course.to_string()),
                    semester: v.opt(Column::Semester),
                    session: v.opt(Column::Session),
                    subjects: vec![subject],
                });
            }
        }
    }

    if out.records.is_empty() {
        return Err(ResultsError::UploadParse(
            "no valid student rows found".into(),
        ));
    }
    Ok(out)
}

fn ensure_within_limit(path: &Path, limit: u64) -> Result<()> {
    let size = std::fs::metadata(path)?.len();
    if size > limit {
        return Err(ResultsError::UploadParse(format!(
            "file is {size} bytes; uploads are limited to {limit} bytes"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Progress(u8),
    Finished { records: usize },
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ParsedUpload {
    pub filename: String,
    pub sha256: String,
    pub build: RecordBuild,
}

/// Background upload: parse the file off the request loop, then report
/// progress in fixed steps. Dropping the listener's receiver is allowed; the
/// job keeps going and its sends are ignored.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub path: PathBuf,
    pub default_course: String,
    pub pass_percent: f64,
    pub tick: Duration,
}

pub struct UploadHandle {
    inner: JoinHandle<Result<ParsedUpload>>,
}

impl UploadHandle {
    pub fn join(self) -> Result<ParsedUpload> {
        self.inner
            .join()
            .unwrap_or_else(|_| Err(ResultsError::UploadParse("upload worker panicked".into())))
    }
}

impl UploadJob {
    pub fn spawn(self, listener: Sender<UploadEvent>) -> Result<UploadHandle> {
        let inner = std::thread::Builder::new()
            .name("upload".into())
            .spawn(move || {
                let _ = listener.send(UploadEvent::Progress(0));
                match self.run(&listener) {
                    Ok(parsed) => {
                        let _ = listener.send(UploadEvent::Finished {
                            records: parsed.build.records.len(),
                        });
                        Ok(parsed)
                    }
                    Err(e) => {
                        warn!(path = %self.path.display(), error = %e, "upload failed");
                        let _ = listener.send(UploadEvent::Failed(e.to_string()));
                        Err(e)
                    }
                }
            })?;
        Ok(UploadHandle { inner })
    }

    fn run(&self, listener: &Sender<UploadEvent>) -> Result<ParsedUpload> {
        ensure_within_limit(&self.path, MAX_UPLOAD_BYTES)?;
        let bytes = std::fs::read(&self.path)?;
        let sha256 = Sha256::digest(&bytes)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>();
        let rows = read_rows(&self.path)?;
        debug!(rows = rows.len(), "sheet rows read");
        let build = build_records(&rows, &self.default_course, self.pass_percent)?;

        for step in 1..=PROGRESS_STEPS {
            std::thread::sleep(self.tick);
            let _ = listener.send(UploadEvent::Progress(step * (100 / PROGRESS_STEPS)));
        }

        let filename = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        info!(
            filename = %filename,
            records = build.records.len(),
            warnings = build.warnings.len(),
            "upload parsed"
        );
        Ok(ParsedUpload {
            filename,
            sha256,
            build,
        })
    }
}

impl ParsedUpload {
    pub fn into_batch(self, batch_name: &str, course_type: &str) -> (UploadBatch, Vec<UploadWarning>) {
        let batch = UploadBatch {
            id: Uuid::new_v4().to_string(),
            filename: self.filename,
            uploaded_at: chrono::Utc::now(),
            records: self.build.records.len(),
            status: BatchStatus::Complete,
            batch_name: batch_name.to_string(),
            course_type: course_type.to_string(),
            sha256: Some(self.sha256),
            message: None,
            student_records: self.build.records,
        };
        (batch, self.build.warnings)
    }
}

/// History entry for an upload whose file could not be used.
pub fn failed_batch(path: &Path, batch_name: &str, course_type: &str, message: String) -> UploadBatch {
    UploadBatch {
        id: Uuid::new_v4().to_string(),
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        uploaded_at: chrono::Utc::now(),
        records: 0,
        status: BatchStatus::Error,
        batch_name: batch_name.to_string(),
        course_type: course_type.to_string(),
        sha256: None,
        message: Some(message),
        student_records: Vec::new(),
    }
}
