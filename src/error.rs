//! Error types for herbtrack

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    /// Batch, payment, product, event or actor missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate, ownership mismatch or state conflict
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Settlement proof rejected (gateway signature mismatch)
    #[error("Invalid proof: {0}")]
    InvalidProof(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Whether the caller may retry the same request unchanged.
    ///
    /// Only storage failures qualify; every other kind is decided by the
    /// current ledger state and will repeat.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Internal(_) | LedgerError::Io(_))
    }

    /// Short machine-readable kind for response envelopes
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::NotFound(_) => "not_found",
            LedgerError::Conflict(_) => "conflict",
            LedgerError::Unauthorized(_) => "unauthorized",
            LedgerError::InvalidProof(_) => "invalid_proof",
            LedgerError::InvalidInput(_) | LedgerError::Json(_) => "invalid_input",
            LedgerError::Config(_) => "config",
            LedgerError::Io(_) | LedgerError::Internal(_) => "internal",
        }
    }
}

/// Map a rusqlite error into an internal ledger error with context
pub(crate) fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> LedgerError {
    move |e| LedgerError::Internal(format!("{}: {}", context, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_storage_failures_are_retryable() {
        assert!(LedgerError::Internal("commit failed".into()).is_retryable());
        assert!(!LedgerError::Conflict("owned elsewhere".into()).is_retryable());
        assert!(!LedgerError::InvalidProof("Invalid signature".into()).is_retryable());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(LedgerError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(LedgerError::Unauthorized("x".into()).kind(), "unauthorized");
    }
}
