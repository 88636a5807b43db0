//! Error types for recollect

use thiserror::Error;

use crate::llm::GeneratorError;

/// Main error type for recollect operations
#[derive(Error, Debug)]
pub enum RecollectError {
    /// Storage-related errors (LanceDB, graph consistency, file system)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Embedding generation errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Named entity extraction errors
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Text or object generation failed
    #[error("Generation error: {0}")]
    Generation(#[from] GeneratorError),

    /// Model output could not be interpreted
    #[error("Parse error: {0}")]
    Parse(String),

    /// Retrieval session errors
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// Caller broke an API contract (for example a conversation not ending in a user turn)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General errors
    #[error("{0}")]
    General(String),
}

impl From<serde_json::Error> for RecollectError {
    fn from(e: serde_json::Error) -> Self {
        RecollectError::Serialization(e.to_string())
    }
}

/// Result type alias for recollect operations
pub type Result<T> = std::result::Result<T, RecollectError>;
