//! Error types for the Promptflow core.
//!
//! `CoreError` is used throughout the stores, configuration and the
//! orchestrator's entry points. `BlockError` covers everything that can go
//! wrong while a single block executes; it never escapes the block executor,
//! which turns it into a failed block run.

use crate::engine::llm::LlmError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single block's execution.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    /// Block config does not match the shape its type requires.
    #[error("Invalid block configuration: {0}")]
    Configuration(String),

    /// Missing or invalid template reference.
    #[error("{0}")]
    TemplateRender(String),

    /// Named list absent, of the wrong type, or ambiguous.
    #[error("{0}")]
    ListResolution(String),

    #[error("LLM service error: {0}")]
    LlmService(#[from] LlmError),

    #[error("Block type '{0}' execution not implemented.")]
    UnsupportedBlockType(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(format!("JSON error: {}", e))
    }
}
