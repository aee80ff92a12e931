//! Provider error types.

use std::time::Duration;

use thiserror::Error;
use vgen_models::{FailureClass, TaskError};

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Classified provider failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Rate limit, 5xx, connection reset: worth another attempt
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// Invalid or policy-rejected input: retrying will not help
    #[error("Permanent provider error: {0}")]
    Permanent(String),

    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn class(&self) -> FailureClass {
        match self {
            ProviderError::Transient(_) => FailureClass::Transient,
            ProviderError::Permanent(_) => FailureClass::Permanent,
            ProviderError::Timeout(_) => FailureClass::Timeout,
        }
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    pub fn to_task_error(&self) -> TaskError {
        TaskError::new(self.class(), self.to_string())
    }
}
