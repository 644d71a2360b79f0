//! In-memory HNSW store backend built on ruvector-core.
//!
//! HNSW has no point removal, so deletes and replacements are handled the
//! way a periodic-rebuild index handles them: each upsert inserts a fresh
//! node under a versioned key (`point_id#version`), the previous node is
//! tombstoned, and search filters tombstones and keeps only the current
//! version of each point. Observably there is never more than one live
//! point per id.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use ruvector_core::index::hnsw::HnswIndex;
use ruvector_core::index::VectorIndex;
use ruvector_core::types::{DistanceMetric, HnswConfig};
use tokio::sync::RwLock;

use crate::error::{RecallError, Result};
use crate::store::{sort_scored, Point, PointPayload, ScoredPoint, VectorStore};

struct HnswInner {
    hnsw: HnswIndex,
    /// node key → payload for every node ever inserted.
    payloads: HashMap<String, PointPayload>,
    /// point id → node key of the current live version.
    live: HashMap<String, String>,
    /// node keys superseded by a newer version or deleted outright.
    tombstones: HashSet<String>,
    version: u64,
}

pub struct HnswVectorStore {
    inner: RwLock<HnswInner>,
}

impl HnswVectorStore {
    /// Create an empty index. `capacity` is the expected upper bound of
    /// node insertions (every edit/swipe consumes one slot until the next
    /// rebuild) — can be generous.
    pub fn new(dimensions: usize, capacity: usize) -> Result<Self> {
        let config = HnswConfig {
            m: 16,                // connections per layer
            ef_construction: 200, // build-time quality
            ef_search: 50,        // search-time recall
            max_elements: capacity,
        };
        let hnsw = HnswIndex::new(dimensions, DistanceMetric::Cosine, config)
            .map_err(|e| RecallError::StoreUnavailable(format!("hnsw init: {e}")))?;
        Ok(Self {
            inner: RwLock::new(HnswInner {
                hnsw,
                payloads: HashMap::new(),
                live: HashMap::new(),
                tombstones: HashSet::new(),
                version: 0,
            }),
        })
    }
}

#[async_trait]
impl VectorStore for HnswVectorStore {
    async fn upsert(&self, point: Point) -> Result<()> {
        let mut inner = self.inner.write().await;
        let point_id = point.payload.point_id.clone();
        if let Some(old_key) = inner.live.remove(&point_id) {
            inner.tombstones.insert(old_key);
        }
        inner.version += 1;
        let node_key = format!("{point_id}#{}", inner.version);
        inner
            .hnsw
            .add(node_key.clone(), point.embedding)
            .map_err(|e| RecallError::StoreUnavailable(format!("hnsw add: {e}")))?;
        inner.payloads.insert(node_key.clone(), point.payload);
        inner.live.insert(point_id, node_key);
        Ok(())
    }

    async fn delete(&self, point_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(node_key) = inner.live.remove(point_id) {
            inner.tombstones.insert(node_key);
        }
        Ok(())
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let doomed: Vec<String> = inner
            .live
            .iter()
            .filter(|(_, key)| {
                inner
                    .payloads
                    .get(*key)
                    .is_some_and(|p| p.chat_id == chat_id)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for point_id in doomed {
            if let Some(node_key) = inner.live.remove(&point_id) {
                inner.tombstones.insert(node_key);
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        chat_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let inner = self.inner.read().await;
        let total = inner.hnsw.len();
        if total == 0 || limit == 0 {
            return Ok(vec![]);
        }
        // Over-fetch the whole graph so that tombstoned nodes and other
        // chats' points cannot starve the result set. Chats are small;
        // recall beats shaving milliseconds here.
        let raw = inner
            .hnsw
            .search(query, total)
            .map_err(|e| RecallError::StoreUnavailable(format!("hnsw search: {e}")))?;

        let mut scored: Vec<ScoredPoint> = raw
            .into_iter()
            .filter(|hit| !inner.tombstones.contains(&hit.id))
            .filter_map(|hit| {
                inner.payloads.get(&hit.id).map(|payload| ScoredPoint {
                    payload: payload.clone(),
                    // ruvector-core returns cosine *distance*; convert to
                    // similarity and clamp to [0, 1].
                    score: (1.0 - hit.score).clamp(0.0, 1.0),
                })
            })
            .filter(|sp| sp.payload.chat_id == chat_id)
            .collect();

        sort_scored(&mut scored);
        scored.truncate(limit);
        Ok(scored)
    }

    async fn list_chat(&self, chat_id: &str) -> Result<Vec<PointPayload>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<PointPayload> = inner
            .live
            .values()
            .filter_map(|key| inner.payloads.get(key))
            .filter(|p| p.chat_id == chat_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.message_id);
        Ok(rows)
    }
}
