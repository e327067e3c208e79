use thiserror::Error;

use crate::llm::LlmError;
use crate::store::StoreError;

/// Failure of a pipeline operation, as surfaced to callers.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("access to {0} is not allowed")]
    Forbidden(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

impl PipelineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        PipelineError::NotFound(what.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        PipelineError::Conflict(message.into())
    }
}
