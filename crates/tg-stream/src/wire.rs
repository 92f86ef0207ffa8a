//! Server-sent-event framing: one `data: {json}` line per event, blank line
//! between events.

use serde::{Deserialize, Serialize};

use tg_core::Result;

use crate::event::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameStatus {
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    pub sequence: u64,
    #[serde(default)]
    pub response: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replace: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FrameStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
}

impl From<&StreamEvent> for WireFrame {
    fn from(event: &StreamEvent) -> Self {
        let status = match (event.terminal, event.error.is_some()) {
            (true, true) => Some(FrameStatus::Error),
            (true, false) => Some(FrameStatus::Complete),
            _ => None,
        };
        Self {
            sequence: event.sequence,
            response: event.payload.clone(),
            replace: event.replace,
            status,
            error: event.error.clone(),
            tokens_per_second: None,
        }
    }
}

impl WireFrame {
    pub fn with_tokens_per_second(mut self, tps: f64) -> Self {
        self.tokens_per_second = Some(tps);
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_sse(&self) -> Result<String> {
        Ok(format!("data: {}\n\n", self.to_json()?))
    }

    /// Parse one `data:` line. Comments and other fields yield `None`.
    pub fn parse_sse_line(line: &str) -> Result<Option<Self>> {
        let Some(data) = line.trim_end().strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim_start();
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(data)?))
    }

    pub fn into_event(self) -> StreamEvent {
        StreamEvent {
            sequence: self.sequence,
            payload: self.response,
            replace: self.replace,
            terminal: self.status.is_some(),
            error: match self.status {
                Some(FrameStatus::Error) => Some(self.error.unwrap_or_default()),
                _ => None,
            },
        }
    }
}

/// Split an SSE body into frames, skipping anything that is not a data line.
pub fn parse_sse_body(body: &str) -> Result<Vec<WireFrame>> {
    let mut frames = Vec::new();
    for line in body.lines() {
        if let Some(frame) = WireFrame::parse_sse_line(line)? {
            frames.push(frame);
        }
    }
    Ok(frames)
}
