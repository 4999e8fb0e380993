use crate::db::RecordStore;
use crate::error::ResultsError;
use crate::model::{
    exam_roll_digits, format_sol_roll_no, is_valid_exam_roll_no, is_valid_sol_roll_no,
    StudentRecord, EXAM_ROLL_NO_LEN,
};
use crate::results::ResultService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub sol_roll_no: Option<String>,
    pub exam_roll_no: Option<String>,
}

impl SearchQuery {
    /// Normalize user-typed roll numbers the way the search form does, then
    /// validate their shape. Blank fields count as absent.
    pub fn from_input(sol: Option<&str>, exam: Option<&str>) -> Result<Self, ResultsError> {
        let sol = sol
            .map(format_sol_roll_no)
            .filter(|s| !s.is_empty());
        let exam = exam.map(exam_roll_digits).filter(|s| !s.is_empty());

        if sol.is_none() && exam.is_none() {
            return Err(ResultsError::Validation(
                "enter at least one roll number".to_string(),
            ));
        }
        if let Some(s) = sol.as_deref() {
            if !is_valid_sol_roll_no(s) {
                return Err(ResultsError::Validation(
                    "SOL Roll Number must be in format 00-0-00-000000 (14 characters)".to_string(),
                ));
            }
        }
        if let Some(e) = exam.as_deref() {
            if !is_valid_exam_roll_no(e) {
                return Err(ResultsError::Validation(format!(
                    "Exam Roll Number must be {EXAM_ROLL_NO_LEN} digits"
                )));
            }
        }
        Ok(Self {
            sol_roll_no: sol,
            exam_roll_no: exam,
        })
    }
}

/// One search interaction: `Idle -> Submitted -> {Found, NotFound, Error}`.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchState {
    Idle,
    Submitted(SearchQuery),
    Found(Box<StudentRecord>),
    NotFound,
    Error(String),
}

impl SearchState {
    pub fn name(&self) -> &'static str {
        match self {
            SearchState::Idle => "idle",
            SearchState::Submitted(_) => "submitted",
            SearchState::Found(_) => "found",
            SearchState::NotFound => "notFound",
            SearchState::Error(_) => "error",
        }
    }

    #[allow(dead_code)]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SearchState::Found(_) | SearchState::NotFound | SearchState::Error(_)
        )
    }
}

#[derive(Debug)]
pub struct SearchSession {
    state: SearchState,
}

impl Default for SearchSession {
    fn default() -> Self {
        Self {
            state: SearchState::Idle,
        }
    }
}

impl SearchSession {
    #[allow(dead_code)]
    pub fn state(&self) -> &SearchState {
        &self.state
    }

    /// Run one submission to a terminal state. Invalid input never reaches
    /// `Submitted`; the session goes straight to `Error`.
    pub fn submit<S: RecordStore>(
        &mut self,
        service: &ResultService<'_, S>,
        sol: Option<&str>,
        exam: Option<&str>,
    ) -> Result<&SearchState, ResultsError> {
        let query = match SearchQuery::from_input(sol, exam) {
            Ok(q) => q,
            Err(e) => {
                self.state = SearchState::Error(e.to_string());
                return Err(e);
            }
        };
        self.state = SearchState::Submitted(query.clone());

        match service.lookup(query.sol_roll_no.as_deref(), query.exam_roll_no.as_deref()) {
            Ok(record) => {
                self.state = SearchState::Found(Box::new(record));
                Ok(&self.state)
            }
            Err(ResultsError::NotFound) => {
                self.state = SearchState::NotFound;
                Ok(&self.state)
            }
            Err(e) => {
                self.state = SearchState::Error(e.to_string());
                Err(e)
            }
        }
    }
}
