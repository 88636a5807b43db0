//! Memory types for recollect
//!
//! Defines the stored [`Memory`] record plus the feedback vocabulary used to
//! reinforce memories after they were shown to a user.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::memory::relevance::TimeRelevance;
use crate::memory::source::Source;

/// Dimension of every stored embedding
pub const EMBEDDING_DIMENSION: usize = 384;

/// Current time in epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Normalise an entity name: lower-case with whitespace runs collapsed to `-`
pub fn normalize_entity(name: &str) -> String {
    name.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Count how often each entity occurs in `text`.
///
/// Both sides are normalised first, so "New York" matches "new-york".
/// Overlapping matches count; every entity gets at least one mention.
pub fn count_entity_mentions<S: AsRef<str>>(text: &str, entities: &[S]) -> BTreeMap<String, u32> {
    let haystack = normalize_entity(text);
    let mut counts = BTreeMap::new();

    for entity in entities {
        let needle = normalize_entity(entity.as_ref());
        if needle.is_empty() {
            continue;
        }
        let mut occurrences = 0u32;
        let mut from = 0;
        while let Some(pos) = haystack[from..].find(&needle) {
            occurrences += 1;
            // step one char to allow overlapping matches
            let step = haystack[from + pos..].chars().next().map_or(1, char::len_utf8);
            from += pos + step;
        }
        counts.insert(needle, occurrences.max(1));
    }

    counts
}

/// A single memory stored in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// Unique identifier (uuid hex unless supplied)
    pub id: String,
    /// The remembered text
    pub memory: String,
    /// Normalised entity name to mention count
    pub entities: BTreeMap<String, u32>,
    pub topic: Option<String>,
    pub time_relevance: TimeRelevance,
    /// Estimated truthfulness in 0..=1
    pub truthfulness: f32,
    /// Epoch seconds the memory is about, -1 when unknown
    pub memory_time_point: i64,
    pub source: Source,
    /// Text embedding of `memory` (384 dimensions)
    pub embedding: Vec<f32>,
    /// Epoch milliseconds
    pub creation_time: i64,
    /// Epoch milliseconds
    pub last_access: i64,
    pub total_access_count: u64,
    pub positive_access_count: u64,
    pub negative_access_count: u64,
}

impl Memory {
    /// Create a memory with default metadata. Entities and embedding are
    /// left empty; see [`crate::memory::MemoryBuilder`] to fill them.
    pub fn new(memory: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            memory: memory.into(),
            entities: BTreeMap::new(),
            topic: None,
            time_relevance: TimeRelevance::Always,
            truthfulness: 1.0,
            memory_time_point: -1,
            source: Source::unknown(),
            embedding: Vec::new(),
            creation_time: now,
            last_access: now,
            total_access_count: 0,
            positive_access_count: 0,
            negative_access_count: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    pub fn with_time(mut self, relevance: TimeRelevance, time_point: i64) -> Self {
        self.time_relevance = relevance;
        self.memory_time_point = time_point;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_truthfulness(mut self, truthfulness: f32) -> Self {
        self.truthfulness = truthfulness.clamp(0.0, 1.0);
        self
    }

    /// Replace the entity map, counting mentions in the memory text
    pub fn with_entities<S: AsRef<str>>(mut self, entities: &[S]) -> Self {
        self.entities = count_entity_mentions(&self.memory, entities);
        self
    }

    /// Add entities, incrementing the count of ones already present
    pub fn add_entities<S: AsRef<str>>(&mut self, entities: &[S]) {
        for entity in entities {
            let name = normalize_entity(entity.as_ref());
            if name.is_empty() {
                continue;
            }
            *self.entities.entry(name).or_insert(0) += 1;
        }
    }

    pub fn entity_names(&self) -> Vec<&str> {
        self.entities.keys().map(String::as_str).collect()
    }

    pub fn mentions(&self, entity: &str) -> bool {
        self.entities.contains_key(&normalize_entity(entity))
    }

    /// Whether the memory describes a known point in time
    pub fn has_time_point(&self) -> bool {
        self.memory_time_point >= 0
    }

    /// Record an access, with optional feedback
    pub fn mark_accessed(&mut self, feedback: FeedbackType) {
        self.total_access_count += 1;
        self.last_access = now_ms();
        match feedback {
            FeedbackType::Positive => self.positive_access_count += 1,
            FeedbackType::Negative => self.negative_access_count += 1,
            FeedbackType::Neutral => {}
        }
    }
}

/// User reaction to a surfaced memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeedbackType {
    Positive,
    Negative,
    #[default]
    Neutral,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackType::Positive => "POSITIVE",
            FeedbackType::Negative => "NEGATIVE",
            FeedbackType::Neutral => "NEUTRAL",
        }
    }
}

/// Feedback on one memory and the entities that made it useful or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFeedback {
    pub memory_id: String,
    pub feedback: FeedbackType,
    #[serde(default)]
    pub entities: Vec<String>,
}

impl MemoryFeedback {
    pub fn new(memory_id: impl Into<String>, feedback: FeedbackType) -> Self {
        Self {
            memory_id: memory_id.into(),
            feedback,
            entities: Vec::new(),
        }
    }

    pub fn with_entities<S: AsRef<str>>(mut self, entities: &[S]) -> Self {
        self.entities = entities.iter().map(|e| normalize_entity(e.as_ref())).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_defaults() {
        let m = Memory::new("The sky is blue");
        assert_eq!(m.id.len(), 32);
        assert_eq!(m.time_relevance, TimeRelevance::Always);
        assert_eq!(m.truthfulness, 1.0);
        assert_eq!(m.memory_time_point, -1);
        assert!(!m.has_time_point());
        assert_eq!(m.creation_time, m.last_access);
        assert_eq!(m.total_access_count, 0);
    }

    #[test]
    fn test_truthfulness_is_clamped() {
        assert_eq!(Memory::new("x").with_truthfulness(0.4).truthfulness, 0.4);
        assert_eq!(Memory::new("x").with_truthfulness(7.0).truthfulness, 1.0);
        assert_eq!(Memory::new("x").with_truthfulness(-1.0).truthfulness, 0.0);
    }

    #[test]
    fn test_normalize_entity() {
        assert_eq!(normalize_entity("New   York"), "new-york");
        assert_eq!(normalize_entity(" Ahri "), "ahri");
        assert_eq!(normalize_entity(""), "");
    }

    #[test]
    fn test_count_entity_mentions() {
        let counts = count_entity_mentions(
            "Senko San met Ahri. Later, senko san and ahri and Yuzu had tea.",
            &["Senko San", "Ahri", "Fubuki"],
        );
        assert_eq!(counts.get("senko-san"), Some(&2));
        assert_eq!(counts.get("ahri"), Some(&2));
        // never observed in the text, still recorded once
        assert_eq!(counts.get("fubuki"), Some(&1));
    }

    #[test]
    fn test_add_entities_increments() {
        let mut m = Memory::new("x").with_entities(&["Rust"]);
        m.add_entities(&["rust", "Tokio Runtime"]);
        assert_eq!(m.entities.get("rust"), Some(&2));
        assert_eq!(m.entities.get("tokio-runtime"), Some(&1));
        assert!(m.mentions("Tokio   runtime"));
    }

    #[test]
    fn test_mark_accessed_counts_feedback() {
        let mut m = Memory::new("x");
        m.mark_accessed(FeedbackType::Positive);
        m.mark_accessed(FeedbackType::Negative);
        m.mark_accessed(FeedbackType::Neutral);
        assert_eq!(m.total_access_count, 3);
        assert_eq!(m.positive_access_count, 1);
        assert_eq!(m.negative_access_count, 1);
    }

    #[test]
    fn test_feedback_serialization() {
        let json = serde_json::to_string(&FeedbackType::Positive).unwrap();
        assert_eq!(json, "\"POSITIVE\"");
    }
}
