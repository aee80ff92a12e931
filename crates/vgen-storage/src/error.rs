//! Storage errors.

use std::fmt;

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// Store operation that hit a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Put,
    Get,
    Head,
    Delete,
    List,
    Connect,
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Put => "put",
            Self::Get => "get",
            Self::Head => "head",
            Self::Delete => "delete",
            Self::List => "list",
            Self::Connect => "connect",
        })
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage not configured: {0}")]
    Config(String),

    #[error("no object at {0}")]
    NotFound(String),

    /// Write-once violation. The stored object was left as it was.
    #[error("object {0} already written")]
    AlreadyExists(String),

    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("{op} {key} failed: {message}")]
    Backend {
        op: StorageOp,
        key: String,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists(key.into())
    }

    pub fn invalid_key(key: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason,
        }
    }

    pub fn backend(op: StorageOp, key: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Backend {
            op,
            key: key.into(),
            message: err.to_string(),
        }
    }

    /// Backend and I/O failures may clear up on their own. Missing objects,
    /// write-once conflicts and bad keys will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { .. } | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(StorageError::backend(StorageOp::Put, "k", "connection reset").is_retryable());
        assert!(!StorageError::already_exists("k").is_retryable());
        assert!(!StorageError::not_found("k").is_retryable());
        assert!(!StorageError::invalid_key("../k", "relative segment").is_retryable());
    }

    #[test]
    fn test_backend_message_names_operation() {
        let err = StorageError::backend(StorageOp::List, "runs/a/", "timeout");
        assert_eq!(err.to_string(), "list runs/a/ failed: timeout");
    }
}
