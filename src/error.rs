//! Error types for CA store and issuance operations.
//!
//! Every core operation returns [`Result<T>`] which wraps [`CaError`]. Validation errors
//! (`PolicyMismatch`, `InvalidEmail`, `UsageError`) are always raised before the store is
//! touched.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Error type for all CA operations.
#[derive(Debug, Error)]
pub enum CaError {
    /// The store (or its root certificate) already exists
    #[error("already initialized: {0}")]
    AlreadyInitialized(String),

    /// No ledger or serial counter at the store path
    #[error("CA store not initialized at {}", .0.display())]
    NotInitialized(PathBuf),

    /// A leaf was requested before the root certificate was created
    #[error("root certificate not found at {}", .0.display())]
    RootNotFound(PathBuf),

    /// A subject field required to match the CA identity differs
    #[error("policy mismatch on {field}: expected {expected:?}, got {actual:?}")]
    PolicyMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("invalid email address: {0:?}")]
    InvalidEmail(String),

    /// Allocated serial already present in the ledger
    #[error("serial collision: {0}")]
    SerialCollision(String),

    #[error("timed out after {0:?} waiting for the store lock")]
    LockTimeout(Duration),

    /// An OpenSSL operation failed; `step` names the pipeline step
    #[error("signing failed during {step}: {reason}")]
    SigningFailure { step: &'static str, reason: String },

    #[error("verification failed: {0}")]
    VerificationError(String),

    #[error("usage error: {0}")]
    UsageError(String),

    /// Ledger or serial counter content could not be parsed
    #[error("corrupted ledger state: {0}")]
    Ledger(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaError {
    /// Wrap an OpenSSL failure for the named step.
    pub fn signing(step: &'static str, err: impl std::fmt::Display) -> Self {
        CaError::SigningFailure {
            step,
            reason: err.to_string(),
        }
    }

    /// Errors that clear up when the operation is simply attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaError::SerialCollision(_) | CaError::LockTimeout(_))
    }
}

impl From<serde_json::Error> for CaError {
    fn from(e: serde_json::Error) -> Self {
        CaError::Ledger(e.to_string())
    }
}

/// Result type alias for CA operations.
pub type Result<T> = std::result::Result<T, CaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(CaError::LockTimeout(Duration::from_secs(1)).is_retryable());
        assert!(CaError::SerialCollision("1000".into()).is_retryable());
        assert!(!CaError::InvalidEmail("a@b".into()).is_retryable());
        assert!(!CaError::signing("sign certificate", "boom").is_retryable());
    }

    #[test]
    fn signing_failure_names_step() {
        let err = CaError::signing("generate key pair", "entropy exhausted");
        assert_eq!(
            err.to_string(),
            "signing failed during generate key pair: entropy exhausted"
        );
    }
}
