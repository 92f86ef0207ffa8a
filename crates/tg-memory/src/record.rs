use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type RecordId = u64;

/// One cached item. A record can be found by `key`, by `embedding`, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    #[serde(default)]
    pub id: RecordId,
    pub key: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Eviction weight in [0, 1].
    pub importance: f32,
}

impl MemoryRecord {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            key: None,
            embedding: None,
            payload: payload.into(),
            created_at: now,
            last_accessed_at: now,
            importance: 0.5,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    /// Payload as UTF-8 text, if it is text.
    pub fn payload_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn size_bytes(&self) -> u64 {
        self.payload.len() as u64
    }

    /// One JSON Lines entry, without the trailing newline.
    pub fn to_jsonl(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_jsonl(line: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}
