use crate::state::RunStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranslatorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Malformed model response: {0}")]
    MalformedResponse(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Row count mismatch: expected {expected}, got {got}")]
    RowCountMismatch { expected: usize, got: usize },

    #[error("Column count mismatch in row {row}: expected {expected}, got {got}")]
    ColumnCountMismatch {
        row: usize,
        expected: usize,
        got: usize,
    },

    #[error("Dataset has no data rows")]
    EmptyDataset,

    #[error("Invalid job configuration: {0}")]
    InvalidJob(String),

    #[error("Invalid transition: cannot apply {event} while {from}")]
    InvalidTransition { from: RunStatus, event: &'static str },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),
}

pub type Result<T> = std::result::Result<T, TranslatorError>;
