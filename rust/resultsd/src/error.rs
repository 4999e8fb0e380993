use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResultsError {
    /// Missing or malformed identifier input.
    #[error("{0}")]
    Validation(String),

    #[error("no result found for the given roll number")]
    NotFound,

    #[error("upload batch not found: {0}")]
    BatchNotFound(String),

    /// The uploaded file could not be turned into student records.
    #[error("{0}")]
    UploadParse(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("failed to encode stored value: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResultsError {
    /// Stable code reported to IPC clients.
    pub fn code(&self) -> &'static str {
        match self {
            ResultsError::Validation(_) => "validation_failed",
            ResultsError::NotFound | ResultsError::BatchNotFound(_) => "not_found",
            ResultsError::UploadParse(_) => "upload_parse_failed",
            ResultsError::Storage(_) => "db_query_failed",
            ResultsError::Serialize(_) => "db_query_failed",
            ResultsError::Io(_) => "io_failed",
        }
    }
}

pub type Result<T> = std::result::Result<T, ResultsError>;
