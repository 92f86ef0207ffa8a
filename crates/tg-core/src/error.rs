use std::time::Duration;

use thiserror::Error;

use crate::types::{Feature, Operation, ResourceDimension};

#[derive(Error, Debug)]
pub enum GovernError {
    #[error("Quota exceeded for {dimension}: used {used} of {limit}")]
    QuotaExceeded {
        dimension: ResourceDimension,
        used: u64,
        limit: u64,
    },
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("Concurrency limit reached for {operation}: {in_flight} of {limit} in flight")]
    ConcurrencyExceeded {
        operation: Operation,
        in_flight: usize,
        limit: usize,
    },
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("Session expired: {session_id}")]
    SessionExpired { session_id: String },
    #[error("Feature {feature} is not enabled for this tier")]
    FeatureDisabled { feature: Feature },
    #[error("Dimension {dimension} is not metered for this session")]
    DimensionNotMetered { dimension: ResourceDimension },
    #[error("Stream not found: {stream_id}")]
    StreamNotFound { stream_id: String },
    #[error("Stream already terminated: {stream_id}")]
    StreamTerminated { stream_id: String },
    #[error("Timed out waiting for stream events after {0:?}")]
    StreamTimeout(Duration),
    #[error("Memory store error: {0}")]
    Memory(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GovernError {
    /// Resource-gate rejections a caller can recover from by backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded { .. } | Self::RateLimited { .. } | Self::ConcurrencyExceeded { .. }
        )
    }

    /// Suggested wait before retrying, when the gate knows one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GovernError>;
