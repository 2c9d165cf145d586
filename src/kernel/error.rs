//! Kernel-specific error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("WAL entry corrupted at offset {offset}: {reason}")]
    WalCorrupted { offset: u64, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode WAL payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type KernelResult<T> = Result<T, KernelError>;
