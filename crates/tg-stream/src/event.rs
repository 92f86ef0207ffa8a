use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One message on a stream.
///
/// `replace = true` means "discard everything received so far and take
/// `payload` as the whole output".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub sequence: u64,
    pub payload: String,
    #[serde(default)]
    pub replace: bool,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamEvent {
    pub fn delta(sequence: u64, payload: impl Into<String>) -> Self {
        Self {
            sequence,
            payload: payload.into(),
            replace: false,
            terminal: false,
            error: None,
        }
    }

    pub fn replace(sequence: u64, payload: impl Into<String>) -> Self {
        Self {
            replace: true,
            ..Self::delta(sequence, payload)
        }
    }

    pub fn completed(sequence: u64) -> Self {
        Self {
            terminal: true,
            ..Self::delta(sequence, "")
        }
    }

    pub fn failed(sequence: u64, error: impl Into<String>) -> Self {
        Self {
            terminal: true,
            error: Some(error.into()),
            ..Self::delta(sequence, "")
        }
    }

    pub fn is_failure(&self) -> bool {
        self.terminal && self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Open,
    /// Accepting output but holding delivery until resumed.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl StreamStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Open | Self::Paused)
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Producer-side counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStats {
    pub events_emitted: u64,
    pub bytes_emitted: u64,
    pub opened_at: DateTime<Utc>,
    pub last_emit_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StreamStats {
    pub fn new(opened_at: DateTime<Utc>) -> Self {
        Self {
            events_emitted: 0,
            bytes_emitted: 0,
            opened_at,
            last_emit_at: None,
            finished_at: None,
        }
    }

    /// Rough throughput, counting four bytes per token.
    pub fn tokens_per_second(&self) -> f64 {
        let Some(last) = self.last_emit_at else {
            return 0.0;
        };
        let elapsed = (last - self.opened_at).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return 0.0;
        }
        (self.bytes_emitted as f64 / 4.0) / elapsed
    }
}

/// Consumer-side accumulator that applies events to rebuild the output.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    text: String,
    last_sequence: u64,
    finished: bool,
    error: Option<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `event`; stale or duplicate sequences are ignored.
    pub fn apply(&mut self, event: &StreamEvent) -> bool {
        if event.sequence <= self.last_sequence {
            return false;
        }
        self.last_sequence = event.sequence;
        if event.replace {
            self.text.clear();
        }
        self.text.push_str(&event.payload);
        if event.terminal {
            self.finished = true;
            self.error = event.error.clone();
        }
        true
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}
