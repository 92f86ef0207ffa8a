//! Dual-mode record store: exact key index plus similarity index.
//!
//! Reads (`get`, `search`) count as accesses and refresh a record's recency,
//! which feeds straight into eviction order. They only take the read lock;
//! access stamps are atomics on each entry.
//!
//! The similarity index is locked separately from the record map. A search
//! that scored the index before a concurrent `put` committed will not see the
//! new record; that is accepted staleness, not a lost write.

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use tg_core::{Clock, MemoryConfig};

use crate::error::{MemoryError, Result};
use crate::index::{DistanceMetric, FlatIndex};
use crate::record::{MemoryRecord, RecordId};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub capacity: usize,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub importance_weight: f32,
    pub recency_weight: f32,
    pub recency_half_life: Duration,
}

impl StoreConfig {
    pub fn from_config(config: &MemoryConfig, capacity: usize) -> Self {
        Self {
            capacity,
            dimension: config.dimension,
            metric: DistanceMetric::from_str_loose(&config.metric),
            importance_weight: config.importance_weight,
            recency_weight: config.recency_weight,
            recency_half_life: Duration::from_secs(config.recency_half_life_secs),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(MemoryError::InvalidConfig("dimension must be positive".into()));
        }
        if self.recency_half_life.is_zero() {
            return Err(MemoryError::InvalidConfig("recency half-life must be positive".into()));
        }
        if self.importance_weight < 0.0 || self.recency_weight < 0.0 {
            return Err(MemoryError::InvalidConfig("eviction weights must be non-negative".into()));
        }
        Ok(())
    }
}

/// What a `put` did besides storing the record.
#[derive(Debug, Clone, Default)]
pub struct PutOutcome {
    pub id: RecordId,
    /// Previous record under the same key, if this was an overwrite.
    pub replaced: Option<MemoryRecord>,
    /// Records pushed out to get back under capacity.
    pub evicted: Vec<MemoryRecord>,
}

struct Entry {
    record: MemoryRecord,
    accessed_ms: AtomicI64,
    accessed_tick: AtomicU64,
}

impl Entry {
    fn new(record: MemoryRecord, tick: u64) -> Self {
        let ms = record.last_accessed_at.timestamp_millis();
        Self {
            record,
            accessed_ms: AtomicI64::new(ms),
            accessed_tick: AtomicU64::new(tick),
        }
    }

    fn touch(&self, now: DateTime<Utc>, tick: u64) {
        self.accessed_ms.fetch_max(now.timestamp_millis(), Ordering::Relaxed);
        self.accessed_tick.fetch_max(tick, Ordering::Relaxed);
    }

    fn tick(&self) -> u64 {
        self.accessed_tick.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> MemoryRecord {
        let mut record = self.record.clone();
        if let Some(at) = DateTime::from_timestamp_millis(self.accessed_ms.load(Ordering::Relaxed)) {
            record.last_accessed_at = at;
        }
        record
    }
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<RecordId, Entry>,
    keys: HashMap<String, RecordId>,
}

pub struct MemoryStore {
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    inner: RwLock<StoreInner>,
    index: FlatIndex,
    next_id: AtomicU64,
    access_tick: AtomicU64,
}

impl MemoryStore {
    pub fn new(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            index: FlatIndex::new(config.dimension, config.metric),
            config,
            clock,
            inner: RwLock::new(StoreInner::default()),
            next_id: AtomicU64::new(1),
            access_tick: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Sum of payload sizes currently held.
    pub fn total_bytes(&self) -> u64 {
        self.inner.read().entries.values().map(|e| e.record.size_bytes()).sum()
    }

    /// Current time at the millisecond precision access stamps are kept in.
    fn now(&self) -> DateTime<Utc> {
        let now = self.clock.utc();
        DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
    }

    fn next_tick(&self) -> u64 {
        self.access_tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Store `record`, overwriting any record with the same key, then evict
    /// down to capacity.
    pub fn put(&self, mut record: MemoryRecord) -> Result<PutOutcome> {
        if let Some(embedding) = &record.embedding {
            self.index.check_dimension(embedding)?;
        }
        record.importance = sanitize_importance(record.importance);
        let now = self.now();
        let tick = self.next_tick();

        let (id, replaced) = {
            let mut inner = self.inner.write();
            let existing = record.key.as_ref().and_then(|k| inner.keys.get(k).copied());
            let id = existing.unwrap_or_else(|| self.next_id.fetch_add(1, Ordering::Relaxed));

            match &record.embedding {
                Some(embedding) => self.index.upsert(id, embedding)?,
                None => self.index.remove(id),
            }

            let replaced = existing.and_then(|old| inner.entries.remove(&old));
            record.id = id;
            record.created_at = replaced.as_ref().map(|e| e.record.created_at).unwrap_or(now);
            record.last_accessed_at = now;
            if let Some(key) = &record.key {
                inner.keys.insert(key.clone(), id);
            }
            inner.entries.insert(id, Entry::new(record, tick));
            (id, replaced.map(|e| e.snapshot()))
        };

        debug!(record_id = id, overwrite = replaced.is_some(), "Stored memory record");
        let evicted = self.evict_if_needed();
        Ok(PutOutcome { id, replaced, evicted })
    }

    /// Exact lookup. A hit refreshes the record's recency.
    pub fn get(&self, key: &str) -> Option<MemoryRecord> {
        let inner = self.inner.read();
        let entry = inner.keys.get(key).and_then(|id| inner.entries.get(id))?;
        entry.touch(self.clock.utc(), self.next_tick());
        Some(entry.snapshot())
    }

    /// Top-`k` records by similarity to `query`, best first; equal scores put
    /// the more recently accessed record first. Every returned record counts
    /// as accessed.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(MemoryRecord, f32)>> {
        let scored = self.index.score_all(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let inner = self.inner.read();
        let mut hits: Vec<(&Entry, f32)> = scored
            .into_iter()
            .filter_map(|(id, score)| inner.entries.get(&id).map(|e| (e, score)))
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.tick().cmp(&a.0.tick())));
        hits.truncate(k);

        let now = self.clock.utc();
        Ok(hits
            .into_iter()
            .map(|(entry, score)| {
                entry.touch(now, self.next_tick());
                (entry.snapshot(), score)
            })
            .collect())
    }

    pub fn remove(&self, key: &str) -> Option<MemoryRecord> {
        let mut inner = self.inner.write();
        let id = inner.keys.remove(key)?;
        self.index.remove(id);
        inner.entries.remove(&id).map(|e| e.snapshot())
    }

    /// Drop every record; returns how many were held.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.write();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.keys.clear();
        self.index.clear();
        count
    }

    /// Retention score of every record, as eviction would rank them now.
    pub fn retention_scores(&self) -> Vec<(RecordId, f32)> {
        let inner = self.inner.read();
        let now_ms = self.clock.utc().timestamp_millis();
        inner
            .entries
            .iter()
            .map(|(id, e)| (*id, self.retention_score(e, now_ms)))
            .collect()
    }

    fn retention_score(&self, entry: &Entry, now_ms: i64) -> f32 {
        let accessed = entry.accessed_ms.load(Ordering::Relaxed);
        let age_secs = (now_ms - accessed).max(0) as f64 / 1000.0;
        let half_life = self.config.recency_half_life.as_secs_f64();
        let recency = 0.5f64.powf(age_secs / half_life) as f32;
        self.config.importance_weight * entry.record.importance + self.config.recency_weight * recency
    }

    /// Evict lowest-scoring records until the store is within capacity.
    /// Equal scores evict the least recently accessed first.
    pub fn evict_if_needed(&self) -> Vec<MemoryRecord> {
        let mut inner = self.inner.write();
        let len = inner.entries.len();
        if len <= self.config.capacity {
            return Vec::new();
        }

        let now_ms = self.clock.utc().timestamp_millis();
        let mut ranked: Vec<(OrderedFloat<f32>, u64, RecordId)> = inner
            .entries
            .iter()
            .map(|(id, e)| (OrderedFloat(self.retention_score(e, now_ms)), e.tick(), *id))
            .collect();
        ranked.sort_unstable();

        let excess = len - self.config.capacity;
        let mut evicted = Vec::with_capacity(excess);
        for (_, _, id) in ranked.into_iter().take(excess) {
            if let Some(entry) = inner.entries.remove(&id) {
                if let Some(key) = &entry.record.key {
                    inner.keys.remove(key);
                }
                self.index.remove(id);
                evicted.push(entry.snapshot());
            }
        }
        debug!(evicted = evicted.len(), remaining = inner.entries.len(), "Evicted memory records");
        evicted
    }

    /// Every record, in insertion order, without counting as an access.
    pub fn export(&self) -> Vec<MemoryRecord> {
        let inner = self.inner.read();
        let mut records: Vec<MemoryRecord> = inner.entries.values().map(Entry::snapshot).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Load previously exported records, keeping their timestamps. Records
    /// get fresh ids; a key already present is overwritten.
    pub fn import(&self, records: Vec<MemoryRecord>) -> Result<usize> {
        for record in &records {
            if let Some(embedding) = &record.embedding {
                self.index.check_dimension(embedding)?;
            }
        }

        let count = records.len();
        {
            let mut inner = self.inner.write();
            for mut record in records {
                let existing = record.key.as_ref().and_then(|k| inner.keys.get(k).copied());
                if let Some(old) = existing {
                    inner.entries.remove(&old);
                    self.index.remove(old);
                }
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                record.id = id;
                record.importance = sanitize_importance(record.importance);
                if let Some(embedding) = &record.embedding {
                    self.index.upsert(id, embedding)?;
                }
                if let Some(key) = &record.key {
                    inner.keys.insert(key.clone(), id);
                }
                inner.entries.insert(id, Entry::new(record, self.next_tick()));
            }
        }
        self.evict_if_needed();
        Ok(count)
    }
}

fn sanitize_importance(importance: f32) -> f32 {
    if importance.is_nan() {
        0.0
    } else {
        importance.clamp(0.0, 1.0)
    }
}
