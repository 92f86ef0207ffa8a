use parking_lot::RwLock;
use std::collections::HashMap;

use super::DistanceMetric;
use crate::error::{MemoryError, Result};
use crate::record::RecordId;

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Cosine vectors are stored and queried at unit length, so scoring them is a
/// plain dot product. Zero vectors stay zero and score 0 against everything.
fn prepare(metric: DistanceMetric, vector: &[f32]) -> Vec<f32> {
    let mut v = vector.to_vec();
    if metric == DistanceMetric::Cosine {
        let norm = dot(&v, &v).sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
    }
    v
}

fn similarity(metric: DistanceMetric, query: &[f32], stored: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Cosine | DistanceMetric::Ip => dot(query, stored),
        DistanceMetric::L2 => 1.0 / (1.0 + l2_squared(query, stored)),
    }
}

/// Brute-force index: every query scans all stored vectors, so results are
/// exact. Guarded by its own lock, independent of the record map.
pub struct FlatIndex {
    dimension: usize,
    metric: DistanceMetric,
    inner: RwLock<FlatInner>,
}

#[derive(Default)]
struct FlatInner {
    ids: Vec<RecordId>,
    vectors: Vec<Vec<f32>>,
    id_to_slot: HashMap<RecordId, usize>,
}

impl FlatIndex {
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension,
            metric,
            inner: RwLock::new(FlatInner::default()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.inner.read().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        Ok(())
    }

    /// Insert or overwrite the vector stored for `id`.
    pub fn upsert(&self, id: RecordId, vector: &[f32]) -> Result<()> {
        self.check_dimension(vector)?;
        let vec = prepare(self.metric, vector);

        let mut inner = self.inner.write();
        match inner.id_to_slot.get(&id).copied() {
            Some(slot) => inner.vectors[slot] = vec,
            None => {
                let slot = inner.ids.len();
                inner.ids.push(id);
                inner.vectors.push(vec);
                inner.id_to_slot.insert(id, slot);
            }
        }
        Ok(())
    }

    pub fn remove(&self, id: RecordId) {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.id_to_slot.remove(&id) {
            let last = inner.ids.len() - 1;
            if slot != last {
                let moved = inner.ids[last];
                inner.ids.swap(slot, last);
                inner.vectors.swap(slot, last);
                inner.id_to_slot.insert(moved, slot);
            }
            inner.ids.pop();
            inner.vectors.pop();
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.ids.clear();
        inner.vectors.clear();
        inner.id_to_slot.clear();
    }

    /// Similarity of `query` against every indexed vector, unordered.
    pub fn score_all(&self, query: &[f32]) -> Result<Vec<(RecordId, f32)>> {
        self.check_dimension(query)?;
        let query = prepare(self.metric, query);

        let inner = self.inner.read();
        Ok(inner
            .ids
            .iter()
            .zip(&inner.vectors)
            .map(|(&id, vec)| (id, similarity(self.metric, &query, vec)))
            .collect())
    }
}
