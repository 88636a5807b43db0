//! Runs a step's queries against the graph memory store
//!
//! Store failures end here: they are logged and treated as "nothing found",
//! so the retrieval loop never has to handle a storage error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::memory::relevance::query_relevance;
use crate::retrieval::query::{MemoryResult, RetrievalQuery, RetrievalStep};
use crate::retrieval::results::{dedup_by_memory, top_k};
use crate::storage::GraphMemoryStore;

/// Executes retrieval queries and ranks what they find
pub struct Retriever {
    store: Arc<dyn GraphMemoryStore>,
    per_query_limit: usize,
    min_score: f32,
    min_query_results: usize,
}

impl Retriever {
    pub fn new(store: Arc<dyn GraphMemoryStore>, config: &RetrievalConfig) -> Self {
        Self {
            store,
            per_query_limit: config.per_query_limit.max(1),
            min_score: config.min_score,
            min_query_results: config.min_query_results,
        }
    }

    /// Results for every query of `step`, purged to `top_k` and then merged
    /// to one per memory.
    ///
    /// The purge sees each query's own results, so a memory found by several
    /// queries still counts toward every one of their minimums.
    pub async fn retrieve(&self, step: &RetrievalStep, top_k_results: usize) -> Vec<MemoryResult> {
        let mut all = Vec::new();
        for query in &step.queries {
            all.extend(self.run_query(query).await);
        }

        let selected = top_k(
            &all,
            Some(top_k_results),
            Some(self.min_score),
            self.min_query_results,
        );
        let mut results = dedup_by_memory(selected);

        if results.len() < top_k_results {
            // merged duplicates free up slots for the best unselected memories
            let taken: HashSet<String> = results.iter().map(|r| r.memory.id.clone()).collect();
            let rest = dedup_by_memory(
                all.into_iter()
                    .filter(|r| r.score >= self.min_score && !taken.contains(&r.memory.id)),
            );
            let free = top_k_results - results.len();
            results.extend(rest.into_iter().take(free));
            results.sort_by(|a, b| b.score.total_cmp(&a.score));
        }
        debug!(
            "Retrieved {} memories for {} queries",
            results.len(),
            step.queries.len()
        );
        results
    }

    /// Run one query: semantic search and entity lookups merged by memory id
    pub async fn run_query(&self, query: &RetrievalQuery) -> Vec<MemoryResult> {
        let mut found: HashMap<String, MemoryResult> = HashMap::new();
        let mut keep_max = |result: MemoryResult| {
            if found
                .get(&result.memory.id)
                .is_none_or(|existing| result.score > existing.score)
            {
                found.insert(result.memory.id.clone(), result);
            }
        };

        if let Some(embedding_query) = &query.embedding_query {
            match self
                .store
                .query_memories_by_vector(&embedding_query.embedding, self.per_query_limit)
                .await
            {
                Ok(hits) => {
                    for hit in hits {
                        let score = hit.score * embedding_query.weight;
                        keep_max(MemoryResult::new(hit.memory, score, query.id.clone()));
                    }
                }
                Err(e) => warn!("Vector search failed: {}", e),
            }
        }

        if !query.entity_queries.is_empty() {
            let names: Vec<String> = query
                .entity_queries
                .iter()
                .map(|q| q.entity.clone())
                .collect();
            let n_entities = names.len() as f32;

            match self
                .store
                .query_memories_by_entities(&names, self.per_query_limit)
                .await
            {
                Ok(mut by_entity) => {
                    for entity_query in &query.entity_queries {
                        let Some(hits) = by_entity.remove(&entity_query.entity) else {
                            continue;
                        };
                        for hit in hits {
                            let score =
                                (entity_query.weight * (hit.score + 1.0) / n_entities).clamp(0.0, 1.0);
                            keep_max(MemoryResult::new(hit.memory, score, query.id.clone()));
                        }
                    }
                }
                Err(e) => warn!("Entity search failed: {}", e),
            }
        }

        let mut results: Vec<MemoryResult> = found
            .into_values()
            .map(|mut result| {
                result.score = self.time_adjusted(query, &result);
                result
            })
            .collect();
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(self.per_query_limit);
        results
    }

    /// Decay the score by the distance between the query's time and the
    /// memory's, when both are known
    fn time_adjusted(&self, query: &RetrievalQuery, result: &MemoryResult) -> f32 {
        match query.timestamp {
            Some(timestamp) if timestamp >= 0 && result.memory.has_time_point() => query_relevance(
                query.time_relevance,
                timestamp as f64,
                result.memory.time_relevance,
                result.memory.memory_time_point as f64,
                result.score,
            ),
            _ => result.score,
        }
    }
}
