//! Graph memory storage
//!
//! [`GraphMemoryStore`] is the contract the retrieval core talks to. Two
//! backends implement it: [`InMemoryGraphStore`] keeps the whole graph in
//! process, [`LanceGraphStore`] persists nodes and edges as LanceDB tables and
//! answers vector queries from a cosine index.
//!
//! Every operation returns a `Result`. Writes are atomic per call.

pub mod graph;
pub mod lance;
pub mod schema;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::{RecollectError, Result};
use crate::memory::types::{FeedbackType, Memory};

pub use graph::InMemoryGraphStore;
pub use lance::LanceGraphStore;

/// A memory paired with an operation-specific score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f32,
}

impl ScoredMemory {
    pub fn new(memory: Memory, score: f32) -> Self {
        Self { memory, score }
    }
}

/// Aggregate view of one entity node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub name: String,
    /// Number of memories linked to the entity
    pub mention_count: u64,
    /// Co-mentioned entities and edge strength, strongest first
    pub co_mentions: Vec<(String, u64)>,
}

/// Node counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub memories: u64,
    pub entities: u64,
    pub sources: u64,
    pub authors: u64,
}

/// Graph-backed memory store
#[async_trait]
pub trait GraphMemoryStore: Send + Sync {
    /// Whether the backend is reachable and initialised
    async fn is_connected(&self) -> bool;

    /// Drop everything and recreate indexes and the aggregate counter.
    /// Does nothing and returns `false` unless `confirm` is set.
    async fn reset_database(&self, confirm: bool) -> Result<bool>;

    /// Upsert one memory with its source, authors and entity links
    async fn add_memory(&self, memory: &Memory) -> Result<bool> {
        let ids = self.add_memory_batch(std::slice::from_ref(memory)).await?;
        Ok(!ids.is_empty())
    }

    /// Upsert memories, returning their ids in input order.
    ///
    /// Mention edges are upserted with the memory's per-entity count. Entity
    /// mention counts and co-mention strengths only grow for mention edges
    /// created by this call, so re-adding an unchanged memory is idempotent.
    async fn add_memory_batch(&self, memories: &[Memory]) -> Result<Vec<String>>;

    /// Batch add plus `NEXT_IN_SERIES` edges following input order
    async fn add_memory_series(&self, memories: &[Memory]) -> Result<Vec<String>>;

    /// Fetch memories by id. Unknown ids are skipped; order is unspecified.
    async fn query_memories_by_id(&self, ids: &[String]) -> Result<Vec<Memory>>;

    /// For each queried entity, memories mentioning it scored by how many of
    /// the other queried entities they also mention. Ranked by that score,
    /// then most recent access, `limit` per entity.
    async fn query_memories_by_entities(
        &self,
        entities: &[String],
        limit: usize,
    ) -> Result<HashMap<String, Vec<ScoredMemory>>>;

    /// Cosine nearest neighbours, best first
    async fn query_memories_by_vector(&self, vector: &[f32], top_k: usize)
    -> Result<Vec<ScoredMemory>>;

    /// Strengthen `RELATED_TO` between every pair of `ids`
    async fn connect_memories(&self, ids: &[String]) -> Result<bool>;

    /// `RELATED_TO` neighbours ranked by connection strength
    async fn query_related_memories(&self, id: &str, top_k: usize) -> Result<Vec<ScoredMemory>>;

    /// Count an access for each id, returning the ids that exist
    async fn update_memory_access(
        &self,
        ids: &[String],
        feedback: FeedbackType,
    ) -> Result<Vec<String>>;

    /// Adjust the mention edges between a memory and the given entities.
    /// Positive feedback strengthens (creating missing edges), negative
    /// weakens down to a floor of one, neutral is a no-op.
    async fn apply_entity_feedback(
        &self,
        memory_id: &str,
        entities: &[String],
        feedback: FeedbackType,
    ) -> Result<bool>;

    /// Window of a series around `origin_id`, in series order, origin included
    async fn query_memory_series(
        &self,
        origin_id: &str,
        previous_n: usize,
        next_n: usize,
    ) -> Result<Vec<Memory>>;

    /// Breadth-first walk over every relationship type. Blacklisted nodes are
    /// neither returned nor walked through. Results are ordered by depth and
    /// scored `1 / max(depth, 0.5)`.
    async fn deep_relationship_traversal(
        &self,
        origin_id: &str,
        max_depth: usize,
        stop_k: usize,
        blacklist: &[String],
    ) -> Result<Vec<ScoredMemory>>;

    async fn get_entity(&self, name: &str) -> Result<Option<EntityRecord>>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// Open the backend selected in `config`
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn GraphMemoryStore>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryGraphStore::new())),
        "lance" => {
            std::fs::create_dir_all(&config.data_dir)?;
            let store = LanceGraphStore::open(&config.data_dir)
                .await?
                .with_index_threshold(config.vector_index_threshold);
            Ok(Arc::new(store))
        }
        other => Err(RecollectError::Config(format!(
            "Unknown storage backend: {other}"
        ))),
    }
}
