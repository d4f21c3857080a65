//! Error types for amem.

use thiserror::Error;

/// Main error type for amem operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Content or query is empty after trimming.
    #[error("Input cannot be empty")]
    EmptyInput,

    /// Content or query exceeds the maximum accepted length.
    #[error("Input too long: {actual_length} characters (maximum {max_length})")]
    InputTooLong {
        max_length: usize,
        actual_length: usize,
    },

    /// Result limit out of range.
    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    /// Any other rejected argument.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No note with the given id.
    #[error("Note not found: {0}")]
    NotFound(String),

    /// A note with the given id already exists.
    #[error("Duplicate note id: {0}")]
    DuplicateId(String),

    /// Embedding or language-model provider failure.
    #[error("Provider error: {0}")]
    Provider(String),

    /// A provider call exceeded its time budget.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// HTTP transport error from a language-model backend.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Store and index disagree and the mismatch could not be repaired.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Vector length does not match the store.
    #[error("Mismatched dimensions: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Vector contains values that cannot be compared.
    #[error("Invalid embedding: {0}")]
    InvalidEmbedding(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error.
    #[error("SQLite error: {0}")]
    SQLite(#[from] rusqlite::Error),

    /// ONNX inference error.
    #[error("Inference error: {0}")]
    Inference(String),

    /// Tokenization error.
    #[error("Tokenization error: {0}")]
    Tokenization(#[from] tokenizers::Error),

    /// ONNX session error.
    #[error("ONNX session error: {0}")]
    Onnx(#[from] ort::Error),

    /// HuggingFace Hub error.
    #[error("HuggingFace Hub error: {0}")]
    HfHub(#[from] hf_hub::api::sync::ApiError),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid date/time.
    #[error("Invalid date/time: {0}")]
    Chrono(#[from] chrono::ParseError),

    /// A blocking or background task failed to complete.
    #[error("Task error: {0}")]
    Task(String),
}

impl Error {
    /// Errors that a caller may reasonably retry: provider failures, timeouts,
    /// and HTTP errors other than client errors (429 excepted).
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Provider(_) | Error::Timeout { .. } | Error::Inference(_) => true,
            Error::Http(e) => e.status().is_none_or(|status| {
                !status.is_client_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task(err.to_string())
    }
}
