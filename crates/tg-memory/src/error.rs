use thiserror::Error;
use tg_core::GovernError;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid persistence scope: {0}")]
    InvalidScope(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

impl From<MemoryError> for GovernError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::Io(e) => GovernError::Io(e),
            MemoryError::Serialization(e) => GovernError::Serialization(e),
            other => GovernError::Memory(other.to_string()),
        }
    }
}
