//! In-process graph store
//!
//! Keeps nodes and adjacency maps behind a single `RwLock`, so each trait
//! call is atomic with respect to every other call on the same store.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;
use tracing::debug;

use super::schema::{NodeRef, ordered_pair, traversal_score, unordered_pairs};
use super::{EntityRecord, GraphMemoryStore, ScoredMemory, StoreStats};
use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::memory::source::Source;
use crate::memory::types::{FeedbackType, Memory, normalize_entity};

type Pair = (String, String);

fn pair_key(a: &str, b: &str) -> Pair {
    let (a, b) = ordered_pair(a, b);
    (a.to_string(), b.to_string())
}

#[derive(Debug, Default)]
struct GraphState {
    memories: HashMap<String, Memory>,
    /// Entity name to number of linked memories
    entities: HashMap<String, u64>,
    /// Memory id to entity name to `MENTIONS.count`
    mentions: HashMap<String, BTreeMap<String, u32>>,
    /// Reverse index of `mentions`
    entity_memories: HashMap<String, BTreeSet<String>>,
    co_mentions: HashMap<Pair, u64>,
    sources: HashMap<String, Source>,
    sourced_from: HashMap<String, String>,
    authors: BTreeSet<String>,
    authored_by: HashMap<String, BTreeSet<String>>,
    next_in_series: HashMap<String, String>,
    prev_in_series: HashMap<String, String>,
    related: HashMap<Pair, u64>,
    /// The `Storage` singleton's memory counter
    memory_count: u64,
}

impl GraphState {
    fn upsert_memory(&mut self, memory: &Memory) {
        let id = memory.id.clone();

        match self.memories.get_mut(&id) {
            Some(existing) => {
                // access statistics and creation time belong to the stored node
                let mut updated = memory.clone();
                updated.creation_time = existing.creation_time;
                updated.last_access = existing.last_access;
                updated.total_access_count = existing.total_access_count;
                updated.positive_access_count = existing.positive_access_count;
                updated.negative_access_count = existing.negative_access_count;
                *existing = updated;
            }
            None => {
                self.memories.insert(id.clone(), memory.clone());
                self.memory_count += 1;
            }
        }

        if let Some(key) = memory.source.source.clone() {
            self.sources
                .entry(key.clone())
                .or_insert_with(|| memory.source.clone());
            self.sourced_from.insert(id.clone(), key);
        }
        for author in &memory.source.authors {
            self.authors.insert(author.clone());
            self.authored_by
                .entry(id.clone())
                .or_default()
                .insert(author.clone());
        }

        let mut created: HashSet<String> = HashSet::new();
        for (entity, count) in &memory.entities {
            if self.link_mention(&id, entity, *count) {
                created.insert(entity.clone());
            }
        }

        let names: Vec<&String> = memory.entities.keys().collect();
        for (a, b) in unordered_pairs(&names) {
            if created.contains(&a) || created.contains(&b) {
                *self.co_mentions.entry((a, b)).or_insert(0) += 1;
            }
        }
    }

    /// Upsert a `MENTIONS` edge; true when the edge is new
    fn link_mention(&mut self, memory_id: &str, entity: &str, count: u32) -> bool {
        let edges = self.mentions.entry(memory_id.to_string()).or_default();
        let is_new = edges.insert(entity.to_string(), count).is_none();
        if is_new {
            *self.entities.entry(entity.to_string()).or_insert(0) += 1;
            self.entity_memories
                .entry(entity.to_string())
                .or_default()
                .insert(memory_id.to_string());
        }
        is_new
    }

    /// Memory with its entity map taken from the current mention edges
    fn hydrate(&self, id: &str) -> Option<Memory> {
        let mut memory = self.memories.get(id)?.clone();
        if let Some(edges) = self.mentions.get(id) {
            memory.entities = edges.clone();
        }
        Some(memory)
    }

    fn neighbours(&self, node: &NodeRef) -> Vec<NodeRef> {
        let mut out = BTreeSet::new();
        match node {
            NodeRef::Memory(id) => {
                if let Some(edges) = self.mentions.get(id) {
                    out.extend(edges.keys().cloned().map(NodeRef::Entity));
                }
                if let Some(next) = self.next_in_series.get(id) {
                    out.insert(NodeRef::Memory(next.clone()));
                }
                if let Some(prev) = self.prev_in_series.get(id) {
                    out.insert(NodeRef::Memory(prev.clone()));
                }
                for (a, b) in self.related.keys() {
                    if a == id {
                        out.insert(NodeRef::Memory(b.clone()));
                    } else if b == id {
                        out.insert(NodeRef::Memory(a.clone()));
                    }
                }
                if let Some(authors) = self.authored_by.get(id) {
                    out.extend(authors.iter().cloned().map(NodeRef::Author));
                }
                if let Some(source) = self.sourced_from.get(id) {
                    out.insert(NodeRef::Source(source.clone()));
                }
            }
            NodeRef::Entity(name) => {
                if let Some(memories) = self.entity_memories.get(name) {
                    out.extend(memories.iter().cloned().map(NodeRef::Memory));
                }
                for (a, b) in self.co_mentions.keys() {
                    if a == name {
                        out.insert(NodeRef::Entity(b.clone()));
                    } else if b == name {
                        out.insert(NodeRef::Entity(a.clone()));
                    }
                }
            }
            NodeRef::Author(name) => {
                for (memory, authors) in &self.authored_by {
                    if authors.contains(name) {
                        out.insert(NodeRef::Memory(memory.clone()));
                    }
                }
            }
            NodeRef::Source(key) => {
                for (memory, source) in &self.sourced_from {
                    if source == key {
                        out.insert(NodeRef::Memory(memory.clone()));
                    }
                }
            }
        }
        out.into_iter().collect()
    }
}

/// Graph store held entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    state: RwLock<GraphState>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphMemoryStore for InMemoryGraphStore {
    async fn is_connected(&self) -> bool {
        true
    }

    async fn reset_database(&self, confirm: bool) -> Result<bool> {
        if !confirm {
            return Ok(false);
        }
        *self.state.write().await = GraphState::default();
        debug!("In-memory graph reset");
        Ok(true)
    }

    async fn add_memory_batch(&self, memories: &[Memory]) -> Result<Vec<String>> {
        let mut state = self.state.write().await;
        for memory in memories {
            state.upsert_memory(memory);
        }
        debug!("Upserted {} memories", memories.len());
        Ok(memories.iter().map(|m| m.id.clone()).collect())
    }

    async fn add_memory_series(&self, memories: &[Memory]) -> Result<Vec<String>> {
        let mut state = self.state.write().await;
        for memory in memories {
            state.upsert_memory(memory);
        }
        for window in memories.windows(2) {
            let (from, to) = (&window[0].id, &window[1].id);
            if from == to {
                continue;
            }
            state.next_in_series.insert(from.clone(), to.clone());
            state.prev_in_series.insert(to.clone(), from.clone());
        }
        Ok(memories.iter().map(|m| m.id.clone()).collect())
    }

    async fn query_memories_by_id(&self, ids: &[String]) -> Result<Vec<Memory>> {
        let state = self.state.read().await;
        let unique: BTreeSet<&String> = ids.iter().collect();
        Ok(unique.into_iter().filter_map(|id| state.hydrate(id)).collect())
    }

    async fn query_memories_by_entities(
        &self,
        entities: &[String],
        limit: usize,
    ) -> Result<HashMap<String, Vec<ScoredMemory>>> {
        let state = self.state.read().await;

        let mut queried: Vec<String> = entities.iter().map(|e| normalize_entity(e)).collect();
        queried.retain(|e| !e.is_empty());
        queried.sort();
        queried.dedup();

        let mut results = HashMap::new();
        for entity in &queried {
            let Some(candidates) = state.entity_memories.get(entity) else {
                continue;
            };

            let mut scored: Vec<(u32, Memory)> = candidates
                .iter()
                .filter_map(|id| {
                    let edges = state.mentions.get(id)?;
                    let diversity = queried
                        .iter()
                        .filter(|other| *other != entity && edges.contains_key(*other))
                        .count() as u32;
                    Some((diversity, state.hydrate(id)?))
                })
                .collect();

            scored.sort_by(|(da, ma), (db, mb)| {
                db.cmp(da)
                    .then(mb.last_access.cmp(&ma.last_access))
                    .then(ma.id.cmp(&mb.id))
            });
            scored.truncate(limit);

            if !scored.is_empty() {
                results.insert(
                    entity.clone(),
                    scored
                        .into_iter()
                        .map(|(d, m)| ScoredMemory::new(m, d as f32))
                        .collect(),
                );
            }
        }

        Ok(results)
    }

    async fn query_memories_by_vector(
        &self,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredMemory>> {
        let state = self.state.read().await;
        let mut scored: Vec<(f32, &String)> = state
            .memories
            .values()
            .filter(|m| m.embedding.len() == vector.len())
            .map(|m| (cosine_similarity(vector, &m.embedding), &m.id))
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(b.1)));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .filter_map(|(score, id)| state.hydrate(id).map(|m| ScoredMemory::new(m, score)))
            .collect())
    }

    async fn connect_memories(&self, ids: &[String]) -> Result<bool> {
        let mut state = self.state.write().await;
        let known: Vec<&String> = ids
            .iter()
            .filter(|id| state.memories.contains_key(*id))
            .collect();
        let pairs = unordered_pairs(&known);
        for (a, b) in &pairs {
            *state.related.entry(pair_key(a, b)).or_insert(0) += 1;
        }
        Ok(!pairs.is_empty())
    }

    async fn query_related_memories(&self, id: &str, top_k: usize) -> Result<Vec<ScoredMemory>> {
        let state = self.state.read().await;
        let mut neighbours: Vec<(u64, &String)> = state
            .related
            .iter()
            .filter_map(|((a, b), strength)| match (a == id, b == id) {
                (true, _) => Some((*strength, b)),
                (_, true) => Some((*strength, a)),
                _ => None,
            })
            .collect();

        neighbours.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(b.1)));
        neighbours.truncate(top_k);

        Ok(neighbours
            .into_iter()
            .filter_map(|(s, other)| state.hydrate(other).map(|m| ScoredMemory::new(m, s as f32)))
            .collect())
    }

    async fn update_memory_access(
        &self,
        ids: &[String],
        feedback: FeedbackType,
    ) -> Result<Vec<String>> {
        let mut state = self.state.write().await;
        let mut updated = Vec::new();
        for id in ids {
            if let Some(memory) = state.memories.get_mut(id) {
                memory.mark_accessed(feedback);
                updated.push(id.clone());
            }
        }
        Ok(updated)
    }

    async fn apply_entity_feedback(
        &self,
        memory_id: &str,
        entities: &[String],
        feedback: FeedbackType,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        if !state.memories.contains_key(memory_id) {
            return Ok(false);
        }

        let mut names: Vec<String> = entities
            .iter()
            .map(|e| normalize_entity(e))
            .filter(|e| !e.is_empty())
            .collect();
        names.sort();
        names.dedup();

        match feedback {
            FeedbackType::Neutral => {}
            FeedbackType::Positive => {
                for name in &names {
                    let existing = state
                        .mentions
                        .get(memory_id)
                        .and_then(|edges| edges.get(name))
                        .copied();
                    match existing {
                        Some(count) => {
                            state.link_mention(memory_id, name, count + 1);
                        }
                        None => {
                            state.link_mention(memory_id, name, 1);
                            let others: Vec<String> = state
                                .mentions
                                .get(memory_id)
                                .map(|edges| edges.keys().filter(|k| *k != name).cloned().collect())
                                .unwrap_or_default();
                            for other in others {
                                *state.co_mentions.entry(pair_key(name, &other)).or_insert(0) += 1;
                            }
                        }
                    }
                }
            }
            FeedbackType::Negative => {
                if let Some(edges) = state.mentions.get_mut(memory_id) {
                    for name in &names {
                        if let Some(count) = edges.get_mut(name) {
                            *count = count.saturating_sub(1).max(1);
                        }
                    }
                }
            }
        }
        Ok(true)
    }

    async fn query_memory_series(
        &self,
        origin_id: &str,
        previous_n: usize,
        next_n: usize,
    ) -> Result<Vec<Memory>> {
        let state = self.state.read().await;
        let Some(origin) = state.hydrate(origin_id) else {
            return Ok(Vec::new());
        };

        let mut seen: HashSet<String> = HashSet::from([origin_id.to_string()]);

        let mut before = Vec::new();
        let mut cursor = origin_id.to_string();
        while before.len() < previous_n {
            let Some(prev) = state.prev_in_series.get(&cursor) else {
                break;
            };
            if !seen.insert(prev.clone()) {
                break;
            }
            if let Some(m) = state.hydrate(prev) {
                before.push(m);
            }
            cursor = prev.clone();
        }
        before.reverse();

        let mut after = Vec::new();
        let mut cursor = origin_id.to_string();
        while after.len() < next_n {
            let Some(next) = state.next_in_series.get(&cursor) else {
                break;
            };
            if !seen.insert(next.clone()) {
                break;
            }
            if let Some(m) = state.hydrate(next) {
                after.push(m);
            }
            cursor = next.clone();
        }

        let mut window = before;
        window.push(origin);
        window.extend(after);
        Ok(window)
    }

    async fn deep_relationship_traversal(
        &self,
        origin_id: &str,
        max_depth: usize,
        stop_k: usize,
        blacklist: &[String],
    ) -> Result<Vec<ScoredMemory>> {
        let state = self.state.read().await;
        if !state.memories.contains_key(origin_id) || stop_k == 0 {
            return Ok(Vec::new());
        }

        let blocked: HashSet<NodeRef> = blacklist.iter().cloned().map(NodeRef::Memory).collect();
        let origin = NodeRef::Memory(origin_id.to_string());
        let mut visited: HashSet<NodeRef> = HashSet::from([origin.clone()]);
        let mut queue = VecDeque::from([(origin, 0usize)]);
        let mut results = Vec::new();

        while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for next in state.neighbours(&node) {
                if blocked.contains(&next) || !visited.insert(next.clone()) {
                    continue;
                }
                if let NodeRef::Memory(id) = &next {
                    if let Some(memory) = state.hydrate(id) {
                        results.push(ScoredMemory::new(memory, traversal_score(depth + 1)));
                        if results.len() >= stop_k {
                            return Ok(results);
                        }
                    }
                }
                queue.push_back((next, depth + 1));
            }
        }

        Ok(results)
    }

    async fn get_entity(&self, name: &str) -> Result<Option<EntityRecord>> {
        let state = self.state.read().await;
        let name = normalize_entity(name);
        let Some(&mention_count) = state.entities.get(&name) else {
            return Ok(None);
        };

        let mut co_mentions: Vec<(String, u64)> = state
            .co_mentions
            .iter()
            .filter_map(|((a, b), count)| {
                if *a == name {
                    Some((b.clone(), *count))
                } else if *b == name {
                    Some((a.clone(), *count))
                } else {
                    None
                }
            })
            .collect();
        co_mentions.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        Ok(Some(EntityRecord {
            name,
            mention_count,
            co_mentions,
        }))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let state = self.state.read().await;
        Ok(StoreStats {
            memories: state.memory_count,
            entities: state.entities.len() as u64,
            sources: state.sources.len() as u64,
            authors: state.authors.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::relevance::TimeRelevance;
    use crate::testing::MockEmbedder;
    use crate::embedding::Embedder;

    fn memory(id: &str, text: &str, entities: &[&str]) -> Memory {
        Memory::new(text)
            .with_id(id)
            .with_entities(entities)
            .with_embedding(MockEmbedder.embed(text).unwrap())
    }

    #[tokio::test]
    async fn test_re_add_is_idempotent() {
        let store = InMemoryGraphStore::new();
        let m = memory("m1", "Ahri met Yuzu", &["ahri", "yuzu"]);

        store.add_memory(&m).await.unwrap();
        store.add_memory(&m).await.unwrap();
        store.add_memory_batch(&[m.clone(), m.clone()]).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.memories, 1);
        assert_eq!(stats.entities, 2);

        let ahri = store.get_entity("Ahri").await.unwrap().unwrap();
        assert_eq!(ahri.mention_count, 1);
        assert_eq!(ahri.co_mentions, vec![("yuzu".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_co_mentions_count_once_per_memory() {
        let store = InMemoryGraphStore::new();
        store
            .add_memory_batch(&[
                memory("m1", "a", &["ahri", "yuzu", "fubuki"]),
                memory("m2", "b", &["ahri", "yuzu"]),
            ])
            .await
            .unwrap();

        let ahri = store.get_entity("ahri").await.unwrap().unwrap();
        assert_eq!(ahri.mention_count, 2);
        assert_eq!(ahri.co_mentions[0], ("yuzu".to_string(), 2));
        assert_eq!(ahri.co_mentions[1], ("fubuki".to_string(), 1));
    }

    #[tokio::test]
    async fn test_re_add_keeps_access_statistics() {
        let store = InMemoryGraphStore::new();
        let m = memory("m1", "text", &[]);
        store.add_memory(&m).await.unwrap();
        store
            .update_memory_access(&["m1".to_string()], FeedbackType::Positive)
            .await
            .unwrap();

        let changed = m.clone().with_time(TimeRelevance::Day, 100);
        store.add_memory(&changed).await.unwrap();

        let stored = store.query_memories_by_id(&["m1".to_string()]).await.unwrap();
        assert_eq!(stored[0].total_access_count, 1);
        assert_eq!(stored[0].positive_access_count, 1);
        assert_eq!(stored[0].time_relevance, TimeRelevance::Day);
    }

    #[tokio::test]
    async fn test_source_and_authors_are_linked() {
        let store = InMemoryGraphStore::new();
        let source = Source::from_web(
            "https://example.com/jwst",
            &["Jane Doe".to_string(), "John Smith".to_string()],
            Some("Example Publisher"),
        );
        let m1 = memory("m1", "one", &[]).with_source(source.clone());
        let m2 = memory("m2", "two", &[]).with_source(source);
        store.add_memory_batch(&[m1, m2]).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.sources, 1);
        assert_eq!(stats.authors, 2);

        // both memories share the source node, so they are two hops apart
        let found = store
            .deep_relationship_traversal("m1", 2, 10, &[])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].memory.id, "m2");
        assert_eq!(found[0].score, 0.5);
    }

    #[tokio::test]
    async fn test_entity_feedback_adjusts_mention_edges() {
        let store = InMemoryGraphStore::new();
        store.add_memory(&memory("m1", "x", &["ahri"])).await.unwrap();

        store
            .apply_entity_feedback("m1", &["Ahri".to_string(), "Yuzu".to_string()], FeedbackType::Positive)
            .await
            .unwrap();
        let m = &store.query_memories_by_id(&["m1".to_string()]).await.unwrap()[0];
        assert_eq!(m.entities.get("ahri"), Some(&2));
        assert_eq!(m.entities.get("yuzu"), Some(&1));
        let yuzu = store.get_entity("yuzu").await.unwrap().unwrap();
        assert_eq!(yuzu.co_mentions, vec![("ahri".to_string(), 1)]);

        for _ in 0..3 {
            store
                .apply_entity_feedback("m1", &["ahri".to_string()], FeedbackType::Negative)
                .await
                .unwrap();
        }
        let m = &store.query_memories_by_id(&["m1".to_string()]).await.unwrap()[0];
        assert_eq!(m.entities.get("ahri"), Some(&1));

        assert!(
            !store
                .apply_entity_feedback("missing", &["ahri".to_string()], FeedbackType::Positive)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_reset_requires_confirmation() {
        let store = InMemoryGraphStore::new();
        store.add_memory(&memory("m1", "x", &["a"])).await.unwrap();
        assert!(!store.reset_database(false).await.unwrap());
        assert_eq!(store.stats().await.unwrap().memories, 1);
        assert!(store.reset_database(true).await.unwrap());
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
    }
}
