//! Contract tests run against every GraphMemoryStore backend

use std::sync::Arc;

use recollect::embedding::Embedder;
use recollect::memory::{FeedbackType, Memory};
use recollect::storage::{GraphMemoryStore, InMemoryGraphStore, LanceGraphStore};
use recollect::testing::MockEmbedder;
use tempfile::TempDir;

fn memory(id: &str, text: &str, entities: &[&str]) -> Memory {
    Memory::new(text)
        .with_id(id)
        .with_entities(entities)
        .with_embedding(MockEmbedder.embed(text).unwrap())
}

fn ids(memories: &[Memory]) -> Vec<&str> {
    memories.iter().map(|m| m.id.as_str()).collect()
}

async fn lance_store() -> (TempDir, LanceGraphStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = LanceGraphStore::open(dir.path()).await.unwrap();
    (dir, store)
}

async fn entity_diversity_ranking(store: &dyn GraphMemoryStore) {
    store
        .add_memory_batch(&[
            memory("m1", "Alpha and Beta", &["A", "B"]),
            memory("m2", "Only Alpha", &["A"]),
            memory("m3", "Alpha, Beta and Gamma", &["A", "B", "C"]),
        ])
        .await
        .unwrap();

    let entities = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let results = store.query_memories_by_entities(&entities, 10).await.unwrap();

    let for_a: Vec<&str> = results["a"].iter().map(|r| r.memory.id.as_str()).collect();
    assert_eq!(for_a, vec!["m3", "m1", "m2"]);
    let scores: Vec<f32> = results["a"].iter().map(|r| r.score).collect();
    assert_eq!(scores, vec![2.0, 1.0, 0.0]);

    assert_eq!(results["c"].len(), 1);
}

async fn vector_self_match(store: &dyn GraphMemoryStore) {
    let target = memory("target", "The borrow checker enforces ownership", &[]);
    store
        .add_memory_batch(&[
            memory("other", "Gardening in spring", &[]),
            target.clone(),
            memory("near", "Ownership in Rust", &[]),
        ])
        .await
        .unwrap();

    let results = store.query_memories_by_vector(&target.embedding, 3).await.unwrap();
    assert_eq!(results[0].memory.id, "target");
    assert!((results[0].score - 1.0).abs() < 1e-4);
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));

    let top_one = store.query_memories_by_vector(&target.embedding, 1).await.unwrap();
    assert_eq!(top_one.len(), 1);
}

async fn idempotent_re_add(store: &dyn GraphMemoryStore) {
    let m = memory("m1", "Ada met Babbage", &["Ada", "Babbage"]);
    store.add_memory(&m).await.unwrap();
    store.add_memory(&m).await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.memories, 1);
    assert_eq!(stats.entities, 2);

    let ada = store.get_entity("Ada").await.unwrap().unwrap();
    assert_eq!(ada.mention_count, 1);
    assert_eq!(ada.co_mentions, vec![("babbage".to_string(), 1)]);
}

async fn series_window(store: &dyn GraphMemoryStore) {
    let series: Vec<Memory> = (0..6)
        .map(|i| memory(&format!("s{i}"), &format!("Chapter {i}"), &[]))
        .collect();
    store.add_memory_series(&series).await.unwrap();

    let window = store.query_memory_series("s2", 4, 2).await.unwrap();
    assert_eq!(ids(&window), vec!["s0", "s1", "s2", "s3", "s4"]);

    let tail = store.query_memory_series("s5", 1, 3).await.unwrap();
    assert_eq!(ids(&tail), vec!["s4", "s5"]);

    assert!(store.query_memory_series("missing", 1, 1).await.unwrap().is_empty());
}

async fn traversal_depth_scoring(store: &dyn GraphMemoryStore) {
    // origin -[entity x]- second -RELATED- third
    store
        .add_memory_batch(&[
            memory("origin", "Origin text", &["x"]),
            memory("second", "Second text", &["x"]),
            memory("third", "Third text", &[]),
            memory("island", "Unconnected", &[]),
        ])
        .await
        .unwrap();
    store
        .connect_memories(&["second".to_string(), "third".to_string()])
        .await
        .unwrap();

    let found = store
        .deep_relationship_traversal("origin", 5, 10, &[])
        .await
        .unwrap();
    let scored: Vec<(&str, f32)> = found
        .iter()
        .map(|r| (r.memory.id.as_str(), r.score))
        .collect();
    assert_eq!(scored.len(), 2);
    assert_eq!(scored[0].0, "second");
    assert!((scored[0].1 - 0.5).abs() < 1e-6);
    assert_eq!(scored[1].0, "third");
    assert!((scored[1].1 - 1.0 / 3.0).abs() < 1e-4);

    let blocked = store
        .deep_relationship_traversal("origin", 5, 10, &["second".to_string()])
        .await
        .unwrap();
    assert!(blocked.is_empty());

    let shallow = store
        .deep_relationship_traversal("origin", 2, 10, &[])
        .await
        .unwrap();
    let shallow: Vec<&str> = shallow.iter().map(|r| r.memory.id.as_str()).collect();
    assert_eq!(shallow, vec!["second"]);
}

async fn related_and_access(store: &dyn GraphMemoryStore) {
    store
        .add_memory_batch(&[
            memory("a", "First", &[]),
            memory("b", "Second", &[]),
            memory("c", "Third", &[]),
        ])
        .await
        .unwrap();

    let all = ["a", "b", "c"].map(String::from).to_vec();
    assert!(store.connect_memories(&all).await.unwrap());
    assert!(store
        .connect_memories(&["a".to_string(), "b".to_string()])
        .await
        .unwrap());

    let related = store.query_related_memories("a", 5).await.unwrap();
    assert_eq!(related[0].memory.id, "b");
    assert_eq!(related[0].score, 2.0);
    assert_eq!(related[1].memory.id, "c");
    assert_eq!(related[1].score, 1.0);

    let updated = store
        .update_memory_access(&["a".to_string(), "ghost".to_string()], FeedbackType::Positive)
        .await
        .unwrap();
    assert_eq!(updated, vec!["a".to_string()]);

    let a = store.query_memories_by_id(&["a".to_string()]).await.unwrap();
    assert_eq!(a[0].total_access_count, 1);
    assert_eq!(a[0].positive_access_count, 1);
}

async fn vector_self_match_past_index_threshold(store: &dyn GraphMemoryStore) {
    let memories: Vec<Memory> = (0..300)
        .map(|i| {
            let text = format!("entry{i} alpha{} beta{}", i * 7, i * 13);
            memory(&format!("m{i}"), &text, &[])
        })
        .collect();
    store.add_memory_batch(&memories).await.unwrap();

    for target in [&memories[0], &memories[123], &memories[299]] {
        let results = store.query_memories_by_vector(&target.embedding, 5).await.unwrap();
        assert_eq!(results[0].memory.id, target.id);
        assert!((results[0].score - 1.0).abs() < 1e-3);
    }
}

async fn blacklist_skips_memories_only(store: &dyn GraphMemoryStore) {
    // an entity named like a blacklisted memory is still walkable
    store
        .add_memory_batch(&[
            memory("origin", "Origin text", &["ada"]),
            memory("second", "Second text", &["ada"]),
            memory("ada", "Unrelated", &[]),
        ])
        .await
        .unwrap();

    let found = store
        .deep_relationship_traversal("origin", 3, 10, &["ada".to_string()])
        .await
        .unwrap();
    let found: Vec<&str> = found.iter().map(|r| r.memory.id.as_str()).collect();
    assert_eq!(found, vec!["second"]);
}

async fn re_add_stays_visible_to_readers(store: Arc<dyn GraphMemoryStore>) {
    let m = memory("m1", "Ada met Babbage", &["Ada", "Babbage"]);
    store.add_memory(&m).await.unwrap();

    let writer = {
        let store = Arc::clone(&store);
        let m = m.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                let updated = m.clone().with_topic(format!("revision {i}"));
                store.add_memory(&updated).await.unwrap();
            }
        })
    };

    let id = vec!["m1".to_string()];
    let mut reads = 0;
    while !writer.is_finished() || reads == 0 {
        let found = store.query_memories_by_id(&id).await.unwrap();
        assert_eq!(found.len(), 1, "memory missing during re-add");
        assert_eq!(found[0].entities.len(), 2);
        assert_eq!(store.stats().await.unwrap().memories, 1);
        reads += 1;
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();

    let stored = store.query_memories_by_id(&id).await.unwrap();
    assert_eq!(stored[0].topic.as_deref(), Some("revision 19"));
}

mod in_memory {
    use super::*;

    #[tokio::test]
    async fn test_entity_diversity_ranking() {
        entity_diversity_ranking(&InMemoryGraphStore::new()).await;
    }

    #[tokio::test]
    async fn test_vector_self_match() {
        vector_self_match(&InMemoryGraphStore::new()).await;
    }

    #[tokio::test]
    async fn test_idempotent_re_add() {
        idempotent_re_add(&InMemoryGraphStore::new()).await;
    }

    #[tokio::test]
    async fn test_series_window() {
        series_window(&InMemoryGraphStore::new()).await;
    }

    #[tokio::test]
    async fn test_traversal_depth_scoring() {
        traversal_depth_scoring(&InMemoryGraphStore::new()).await;
    }

    #[tokio::test]
    async fn test_related_and_access() {
        related_and_access(&InMemoryGraphStore::new()).await;
    }

    #[tokio::test]
    async fn test_vector_self_match_past_index_threshold() {
        vector_self_match_past_index_threshold(&InMemoryGraphStore::new()).await;
    }

    #[tokio::test]
    async fn test_blacklist_skips_memories_only() {
        blacklist_skips_memories_only(&InMemoryGraphStore::new()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_re_add_stays_visible_to_readers() {
        re_add_stays_visible_to_readers(Arc::new(InMemoryGraphStore::new())).await;
    }
}

mod lance {
    use super::*;

    #[tokio::test]
    async fn test_entity_diversity_ranking() {
        let (_dir, store) = lance_store().await;
        entity_diversity_ranking(&store).await;
    }

    #[tokio::test]
    async fn test_vector_self_match() {
        let (_dir, store) = lance_store().await;
        vector_self_match(&store).await;
    }

    #[tokio::test]
    async fn test_idempotent_re_add() {
        let (_dir, store) = lance_store().await;
        idempotent_re_add(&store).await;
    }

    #[tokio::test]
    async fn test_series_window() {
        let (_dir, store) = lance_store().await;
        series_window(&store).await;
    }

    #[tokio::test]
    async fn test_traversal_depth_scoring() {
        let (_dir, store) = lance_store().await;
        traversal_depth_scoring(&store).await;
    }

    #[tokio::test]
    async fn test_related_and_access() {
        let (_dir, store) = lance_store().await;
        related_and_access(&store).await;
    }

    #[tokio::test]
    async fn test_vector_self_match_past_index_threshold() {
        let (_dir, store) = lance_store().await;
        vector_self_match_past_index_threshold(&store).await;
        assert!(store.is_indexed());
    }

    #[tokio::test]
    async fn test_blacklist_skips_memories_only() {
        let (_dir, store) = lance_store().await;
        blacklist_skips_memories_only(&store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_re_add_stays_visible_to_readers() {
        let (_dir, store) = lance_store().await;
        re_add_stays_visible_to_readers(Arc::new(store)).await;
    }
}
