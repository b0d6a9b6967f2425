use std::fmt;
use std::panic::Location;

use crate::dtype::DType;

/// Errors raised by tensors, kernels and operators.
///
/// Everything except [`DskError::Fatal`] is a rejected request: it is raised
/// before any work reaches a device queue and leaves no state behind.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DskError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("unsupported dtype: {0}")]
    UnsupportedDType(DType),

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("workspace is not set")]
    WorkspaceNotSet,

    #[error("workspace is null")]
    NullWorkspace,

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("fatal: {0}")]
    Fatal(FatalError),
}

impl DskError {
    /// Whether this error belongs to the unrecoverable class.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DskError::Fatal(_))
    }

    /// Build a fatal error tagged with the caller's source location.
    #[track_caller]
    pub fn fatal(op: &'static str, detail: impl Into<String>) -> Self {
        DskError::Fatal(FatalError {
            op,
            detail: detail.into(),
            location: Location::caller(),
        })
    }
}

/// A device or backend fault. Carries the failing operation, its shape
/// parameters and where it was issued from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    pub op: &'static str,
    pub detail: String,
    pub location: &'static Location<'static>,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed ({}) at file:{}, line:{}",
            self.op,
            self.detail,
            self.location.file(),
            self.location.line()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_carries_location() {
        let err = DskError::fatal("gemm", "(batch, m, n, k) 1 2 3 4");
        assert!(err.is_fatal());
        let msg = err.to_string();
        assert!(msg.contains("gemm failed"), "{msg}");
        assert!(msg.contains("error.rs"), "{msg}");
    }

    #[test]
    fn test_precondition_is_not_fatal() {
        let err = DskError::Precondition("vals must be contiguous".into());
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "precondition failed: vals must be contiguous");
    }
}
