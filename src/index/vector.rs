/// HNSW vector index for similarity search
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ahash::AHashMap;
use hnsw_rs::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use super::{IndexError, IndexResult};
use crate::config::IndexConfig;

/// Graph parameters; changes take effect at the next rebuild
#[derive(Debug, Clone, PartialEq)]
struct GraphParams {
    m: usize,
    ef_construction: usize,
    max_elements: usize,
    max_layers: usize,
    compaction_ratio: f32,
}

impl From<&IndexConfig> for GraphParams {
    fn from(config: &IndexConfig) -> Self {
        Self {
            m: config.hnsw_m.max(2),
            ef_construction: config.ef_construction.max(1),
            max_elements: config.max_elements.max(1),
            max_layers: config.max_layers.clamp(1, 16),
            compaction_ratio: config.compaction_ratio,
        }
    }
}

struct Inner {
    graph: Hnsw<'static, f32, DistCosine>,
    /// slot -> chunk id; `None` marks a tombstone
    slots: Vec<Option<String>>,
    /// chunk id -> live slot
    live: AHashMap<String, usize>,
    /// Live vectors, kept so the graph can be rebuilt without tombstones
    vectors: AHashMap<String, Vec<f32>>,
    tombstones: usize,
    params: GraphParams,
}

impl Inner {
    fn new(params: GraphParams) -> Self {
        let graph = Hnsw::<f32, DistCosine>::new(
            params.m,
            params.max_elements,
            params.max_layers,
            params.ef_construction,
            DistCosine,
        );
        Self {
            graph,
            slots: Vec::new(),
            live: AHashMap::new(),
            vectors: AHashMap::new(),
            tombstones: 0,
            params,
        }
    }

    fn insert(&mut self, chunk_id: String, vector: Vec<f32>) {
        self.remove(&chunk_id);
        let slot = self.slots.len();
        self.graph.insert_slice((vector.as_slice(), slot));
        self.slots.push(Some(chunk_id.clone()));
        self.live.insert(chunk_id.clone(), slot);
        self.vectors.insert(chunk_id, vector);
    }

    fn remove(&mut self, chunk_id: &str) -> bool {
        let Some(slot) = self.live.remove(chunk_id) else {
            return false;
        };
        self.slots[slot] = None;
        self.vectors.remove(chunk_id);
        self.tombstones += 1;
        true
    }

    fn needs_compaction(&self) -> bool {
        !self.slots.is_empty()
            && self.tombstones as f32 / self.slots.len() as f32 > self.params.compaction_ratio
    }

    /// Fresh graph holding only live vectors, inserted in chunk id order
    fn rebuilt(&self, params: GraphParams) -> Self {
        let mut entries: Vec<(&String, &Vec<f32>)> = self.vectors.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let mut fresh = Self::new(params);
        for (id, vector) in entries {
            fresh.insert(id.clone(), vector.clone());
        }
        fresh
    }
}

fn is_zero(vector: &[f32]) -> bool {
    vector.iter().map(|x| x * x).sum::<f32>() <= f32::EPSILON
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorIndexStats {
    pub dimension: usize,
    pub live: usize,
    pub slots: usize,
    pub tombstones: usize,
}

/// Approximate nearest-neighbour index over chunk embeddings.
///
/// hnsw_rs graphs do not support removal, so deletes and upserts tombstone
/// the old slot. Queries over-fetch to make up for dead slots and the graph
/// is rebuilt from the live vectors once tombstones pass
/// `compaction_ratio` of all slots.
pub struct VectorIndex {
    dimension: usize,
    default_ef: RwLock<usize>,
    pending_params: RwLock<GraphParams>,
    inner: RwLock<Inner>,
}

impl VectorIndex {
    pub fn new(dimension: usize, config: &IndexConfig) -> Self {
        let params = GraphParams::from(config);
        Self {
            dimension,
            default_ef: RwLock::new(config.ef_search.max(1)),
            pending_params: RwLock::new(params.clone()),
            inner: RwLock::new(Inner::new(params)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn params(&self) -> GraphParams {
        self.pending_params
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Update search and build parameters. `ef_search` applies to the next
    /// query; graph parameters apply at the next rebuild or compaction.
    pub fn configure(&self, config: &IndexConfig) {
        *self.default_ef.write().unwrap_or_else(PoisonError::into_inner) = config.ef_search.max(1);
        *self
            .pending_params
            .write()
            .unwrap_or_else(PoisonError::into_inner) = GraphParams::from(config);
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Reject vectors the cosine graph cannot rank: wrong dimension,
    /// non-finite components or zero norm. A zero vector has distance 0 to
    /// everything under `DistCosine` and would match every query.
    pub fn validate(&self, chunk_id: &str, vector: &[f32]) -> IndexResult<()> {
        if vector.len() != self.dimension {
            return Err(IndexError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) || is_zero(vector) {
            return Err(IndexError::InvalidVector(chunk_id.to_string()));
        }
        Ok(())
    }

    /// Insert or replace the vector for `chunk_id`
    pub fn upsert(&self, chunk_id: &str, vector: &[f32]) -> IndexResult<()> {
        self.validate(chunk_id, vector)?;
        let mut inner = self.write();
        inner.insert(chunk_id.to_string(), vector.to_vec());
        self.maybe_compact(&mut inner);
        Ok(())
    }

    pub fn upsert_batch(&self, items: &[(String, Vec<f32>)]) -> IndexResult<()> {
        for (id, vector) in items {
            self.validate(id, vector)?;
        }
        let mut inner = self.write();
        for (id, vector) in items {
            inner.insert(id.clone(), vector.clone());
        }
        self.maybe_compact(&mut inner);
        Ok(())
    }

    /// Remove `chunk_id`; returns whether it was present
    pub fn delete(&self, chunk_id: &str) -> bool {
        let mut inner = self.write();
        let removed = inner.remove(chunk_id);
        if removed {
            self.maybe_compact(&mut inner);
        }
        removed
    }

    pub fn delete_many(&self, chunk_ids: &[String]) -> usize {
        let mut inner = self.write();
        let removed = chunk_ids.iter().filter(|id| inner.remove(id)).count();
        if removed > 0 {
            self.maybe_compact(&mut inner);
        }
        removed
    }

    fn maybe_compact(&self, inner: &mut Inner) {
        if inner.needs_compaction() {
            debug!(
                "Compacting vector index: {} tombstones in {} slots",
                inner.tombstones,
                inner.slots.len()
            );
            *inner = inner.rebuilt(self.params());
        }
    }

    /// Replace the whole index with `entries`
    pub fn rebuild(&self, entries: Vec<(String, Vec<f32>)>) -> IndexResult<()> {
        for (id, vector) in &entries {
            self.validate(id, vector)?;
        }
        let mut sorted = entries;
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        sorted.dedup_by(|a, b| a.0 == b.0);

        let mut fresh = Inner::new(self.params());
        for (id, vector) in sorted {
            fresh.insert(id, vector);
        }
        info!("Vector index rebuilt with {} vectors", fresh.live.len());
        *self.write() = fresh;
        Ok(())
    }

    /// The `k` nearest live chunks as `(chunk_id, cosine similarity)`,
    /// ordered by similarity desc then chunk id
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
        ef_search: Option<usize>,
    ) -> IndexResult<Vec<(String, f32)>> {
        if vector.len() != self.dimension {
            return Err(IndexError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        // Nothing is similar to a featureless query
        if is_zero(vector) || vector.iter().any(|x| !x.is_finite()) {
            return Ok(Vec::new());
        }
        let inner = self.read();
        if k == 0 || inner.live.is_empty() {
            return Ok(Vec::new());
        }

        let ef = ef_search.unwrap_or_else(|| *self.default_ef.read().unwrap_or_else(PoisonError::into_inner));
        // Over-fetch so tombstoned slots do not starve the result
        let fetch = (k + inner.tombstones).min(inner.slots.len());
        let ef = ef.max(fetch);

        let mut hits: Vec<(String, f32)> = inner
            .graph
            .search(vector, fetch, ef)
            .into_iter()
            .filter_map(|n| {
                let id = inner.slots.get(n.d_id)?.as_ref()?;
                Some((id.clone(), 1.0 - n.distance))
            })
            .collect();

        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.dedup_by(|a, b| a.0 == b.0);
        hits.truncate(k);
        Ok(hits)
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.read().live.contains_key(chunk_id)
    }

    pub fn len(&self) -> usize {
        self.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> VectorIndexStats {
        let inner = self.read();
        VectorIndexStats {
            dimension: self.dimension,
            live: inner.live.len(),
            slots: inner.slots.len(),
            tombstones: inner.tombstones,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::{normalize, HashEmbedder};

    fn config() -> IndexConfig {
        let mut config = Config::default().index;
        config.max_elements = 1_000;
        config
    }

    fn unit(values: &[f32]) -> Vec<f32> {
        let mut v = values.to_vec();
        normalize(&mut v);
        v
    }

    #[test]
    fn test_query_orders_by_similarity() {
        let index = VectorIndex::new(3, &config());
        index.upsert("a", &unit(&[1.0, 0.0, 0.0])).unwrap();
        index.upsert("b", &unit(&[0.7, 0.7, 0.0])).unwrap();
        index.upsert("c", &unit(&[0.0, 0.0, 1.0])).unwrap();

        let hits = index.query(&unit(&[1.0, 0.1, 0.0]), 3, None).unwrap();
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(hits[0].1 > 0.99);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let index = VectorIndex::new(3, &config());
        let err = index.upsert("a", &[1.0, 0.0]).unwrap_err();
        assert_eq!(
            err,
            IndexError::InvalidDimension {
                expected: 3,
                actual: 2
            }
        );
        assert!(index.query(&[1.0], 1, None).is_err());
    }

    #[test]
    fn test_zero_vectors_never_match() {
        let index = VectorIndex::new(3, &config());
        index.upsert("a", &unit(&[1.0, 0.0, 0.0])).unwrap();
        assert_eq!(
            index.upsert("blank", &[0.0, 0.0, 0.0]).unwrap_err(),
            IndexError::InvalidVector("blank".to_string())
        );
        assert!(index.validate("nan", &[f32::NAN, 0.0, 0.0]).is_err());
        assert!(!index.contains("blank"));

        // A featureless query has no neighbours rather than perfect ones
        assert!(index.query(&[0.0, 0.0, 0.0], 3, None).unwrap().is_empty());
        let hits = index.query(&unit(&[0.0, 1.0, 0.0]), 3, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].1 < 0.5);
    }

    #[test]
    fn test_delete_and_upsert_tombstone() {
        let mut cfg = config();
        cfg.compaction_ratio = 0.9;
        let index = VectorIndex::new(2, &cfg);
        index.upsert("a", &unit(&[1.0, 0.0])).unwrap();
        index.upsert("b", &unit(&[0.0, 1.0])).unwrap();
        index.upsert("a", &unit(&[0.0, 1.0])).unwrap();
        assert!(index.delete("b"));
        assert!(!index.delete("b"));

        let stats = index.stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.tombstones, 2);

        let hits = index.query(&unit(&[1.0, 0.0]), 5, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "a");
    }

    #[test]
    fn test_compaction_drops_tombstones() {
        let mut cfg = config();
        cfg.compaction_ratio = 0.3;
        let index = VectorIndex::new(2, &cfg);
        for i in 0..10 {
            index.upsert(&format!("c{i}"), &unit(&[1.0, i as f32])).unwrap();
        }
        for i in 0..4 {
            index.delete(&format!("c{i}"));
        }
        let stats = index.stats();
        assert_eq!(stats.live, 6);
        assert!(stats.tombstones < 4);
        assert_eq!(index.query(&unit(&[1.0, 9.0]), 10, None).unwrap().len(), 6);
    }

    #[test]
    fn test_rebuild_matches_incremental() {
        let embedder = HashEmbedder::new("hash", 32);
        let texts = ["parse json", "open file", "sort list", "http request", "hash map"];
        let entries: Vec<(String, Vec<f32>)> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| (format!("c{i}"), embedder.embed_text(t)))
            .collect();

        let incremental = VectorIndex::new(32, &config());
        for (id, v) in entries.iter().rev() {
            incremental.upsert(id, v).unwrap();
        }
        let rebuilt = VectorIndex::new(32, &config());
        rebuilt.rebuild(entries.clone()).unwrap();

        let query = embedder.embed_text("read a json file");
        assert_eq!(
            incremental.query(&query, 5, Some(64)).unwrap(),
            rebuilt.query(&query, 5, Some(64)).unwrap()
        );
    }
}
