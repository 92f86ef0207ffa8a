//! Durability hook for memory records. The store itself is purely in-memory;
//! a backend decides whether and where records outlive the process.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{MemoryError, Result};
use crate::record::MemoryRecord;

#[async_trait]
pub trait MemoryPersistence: Send + Sync {
    /// Replace everything stored under `scope` with `records`.
    async fn save(&self, scope: &str, records: &[MemoryRecord]) -> Result<()>;

    /// Records previously saved under `scope`; empty if none.
    async fn load(&self, scope: &str) -> Result<Vec<MemoryRecord>>;

    async fn purge(&self, scope: &str) -> Result<()>;
}

/// One JSON Lines file per scope under a root directory.
#[derive(Debug, Clone)]
pub struct JsonlPersistence {
    root: PathBuf,
}

impl JsonlPersistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, scope: &str) -> Result<PathBuf> {
        let valid = !scope.is_empty()
            && scope
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(MemoryError::InvalidScope(scope.to_string()));
        }
        Ok(self.root.join(format!("{scope}.jsonl")))
    }
}

#[async_trait]
impl MemoryPersistence for JsonlPersistence {
    async fn save(&self, scope: &str, records: &[MemoryRecord]) -> Result<()> {
        let path = self.path_for(scope)?;
        tokio::fs::create_dir_all(&self.root).await?;
        let body = records
            .iter()
            .map(MemoryRecord::to_jsonl)
            .collect::<Result<Vec<_>>>()?
            .join("\n");
        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(scope, records = records.len(), "Saved memory records");
        Ok(())
    }

    async fn load(&self, scope: &str) -> Result<Vec<MemoryRecord>> {
        let path = self.path_for(scope)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(MemoryRecord::from_jsonl)
            .collect()
    }

    async fn purge(&self, scope: &str) -> Result<()> {
        let path = self.path_for(scope)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
