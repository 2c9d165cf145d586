//! Failure categories shared by the ledger and the service envelopes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationFailed,
    NotFound,
    ParameterError,
    TimeoutError,
    MemoryLimitError,
    RuntimeError,
    InvalidName,
    StorageError,
}

impl ErrorKind {
    /// Whether a caller can fix the request and retry. Only storage
    /// failures are not.
    pub fn is_recoverable(self) -> bool {
        self != ErrorKind::StorageError
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationFailed => "ValidationFailed",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::ParameterError => "ParameterError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::MemoryLimitError => "MemoryLimitError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::InvalidName => "InvalidName",
            ErrorKind::StorageError => "StorageError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
