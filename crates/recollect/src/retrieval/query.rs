//! Retrieval session model
//!
//! A [`Retrieval`] covers one user turn. Each round of querying is a
//! [`RetrievalStep`] holding the generated [`RetrievalQuery`]s, the memories
//! they found and the evaluator's summary.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::{Conversation, Message};
use crate::embedding::Embedder;
use crate::error::{RecollectError, Result};
use crate::memory::TimeRelevance;
use crate::memory::types::{Memory, normalize_entity};
use crate::retrieval::results::dedup_by_memory;

/// Reasoning primer used when the user has to clarify their request
pub const CLARIFICATION_PREFIX: &str = "Okay, the user's prompt seems a bit unclear. I should ask for clarification before proceeding. First, ";

const FALLBACK_HEADER: &str = "Okay, this is what I know:\n";
const FALLBACK_FOOTER: &str =
    "\nI should think about the relevant information and then respond accordingly.";

/// Look up memories mentioning one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityQuery {
    /// Normalised entity name
    pub entity: String,
    pub weight: f32,
}

impl EntityQuery {
    pub fn new(entity: &str, weight: f32) -> Result<Self> {
        let entity = normalize_entity(entity);
        if entity.is_empty() {
            return Err(RecollectError::InvalidInput(
                "Entity query needs a non-empty entity".to_string(),
            ));
        }
        Ok(Self { entity, weight })
    }

    /// One query per non-empty name
    pub fn from_entities<S: AsRef<str>>(entities: &[S], weight: f32) -> Vec<Self> {
        entities
            .iter()
            .filter_map(|e| Self::new(e.as_ref(), weight).ok())
            .collect()
    }
}

/// Semantic search by the embedding of `query_text`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingQuery {
    pub query_text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub weight: f32,
}

impl EmbeddingQuery {
    pub fn from_text(query_text: &str, embedder: &dyn Embedder, weight: f32) -> Result<Self> {
        let query_text = query_text.trim();
        if query_text.is_empty() {
            return Err(RecollectError::InvalidInput(
                "Embedding query needs query text".to_string(),
            ));
        }
        Ok(Self {
            query_text: query_text.to_string(),
            embedding: embedder.embed(query_text)?,
            weight,
        })
    }
}

/// One query against the memory store: entity lookups, a semantic search,
/// or both, optionally anchored in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalQuery {
    pub id: String,
    pub entity_queries: Vec<EntityQuery>,
    pub embedding_query: Option<EmbeddingQuery>,
    pub time_relevance: TimeRelevance,
    /// Epoch seconds the query is about
    pub timestamp: Option<i64>,
    /// Short label from the query generator, carried in pipeline updates
    #[serde(default)]
    pub topic: Option<String>,
}

impl RetrievalQuery {
    /// Fails when there is neither an entity nor an embedding part
    pub fn new(
        entity_queries: Vec<EntityQuery>,
        embedding_query: Option<EmbeddingQuery>,
        time_relevance: TimeRelevance,
        timestamp: Option<i64>,
    ) -> Result<Self> {
        if entity_queries.is_empty() && embedding_query.is_none() {
            return Err(RecollectError::InvalidInput(
                "Retrieval query needs entity queries or an embedding query".to_string(),
            ));
        }
        Ok(Self {
            id: Uuid::new_v4().simple().to_string(),
            entity_queries,
            embedding_query,
            time_relevance,
            timestamp,
            topic: None,
        })
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Semantic query on `query_text`, plus any entity queries
    pub fn from_text(
        query_text: &str,
        embedder: &dyn Embedder,
        entity_queries: Vec<EntityQuery>,
        weight: f32,
        time_relevance: TimeRelevance,
        timestamp: Option<i64>,
    ) -> Result<Self> {
        let embedding_query = EmbeddingQuery::from_text(query_text, embedder, weight)?;
        Self::new(entity_queries, Some(embedding_query), time_relevance, timestamp)
    }

    /// Entity-only query
    pub fn from_entities<S: AsRef<str>>(
        entities: &[S],
        weight: f32,
        time_relevance: TimeRelevance,
        timestamp: Option<i64>,
    ) -> Result<Self> {
        Self::new(
            EntityQuery::from_entities(entities, weight),
            None,
            time_relevance,
            timestamp,
        )
    }

    pub fn query_text(&self) -> Option<&str> {
        self.embedding_query.as_ref().map(|q| q.query_text.as_str())
    }

    pub fn entity_names(&self) -> Vec<&str> {
        self.entity_queries.iter().map(|q| q.entity.as_str()).collect()
    }
}

/// A retrieved memory and its score for the query that found it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryResult {
    pub memory: Memory,
    pub score: f32,
    /// Id of the [`RetrievalQuery`] that produced the result
    pub query_id: String,
}

impl MemoryResult {
    pub fn new(memory: Memory, score: f32, query_id: impl Into<String>) -> Self {
        Self {
            memory,
            score,
            query_id: query_id.into(),
        }
    }
}

/// One round of query generation, retrieval and evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalStep {
    pub queries: Vec<RetrievalQuery>,
    pub results: Vec<MemoryResult>,
    /// Query generator reasoning
    pub reasoning: String,
    /// Evaluator summary of the relevant results
    pub summary: String,
    pub clarification_needed: bool,
    /// Step only decides whether clarification is needed
    pub is_pre_query: bool,
}

impl RetrievalStep {
    pub fn new(queries: Vec<RetrievalQuery>) -> Self {
        Self {
            queries,
            ..Self::default()
        }
    }
}

/// Why a retrieval is, or is not yet, done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrievalStatus {
    Active,
    /// Nothing more to look up
    Satisfactory,
    IterationLimit,
    /// Query generation failed on every attempt
    GenerationFailed,
    ClarificationNeeded,
}

/// Multi-round retrieval for one user turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Retrieval {
    /// The user message that started the retrieval
    pub user_prompt: Message,
    pub steps: Vec<RetrievalStep>,
    pub max_iterations: usize,
    pub current_iteration: usize,
    pub done: bool,
    pub satisfactory: bool,
    pub final_summary: String,
    generation_failed: bool,
    summary_result_count: Option<usize>,
}

impl Retrieval {
    /// Start a retrieval for the conversation's last message, which must come
    /// from the user
    pub fn for_conversation(conversation: &Conversation, max_iterations: usize) -> Result<Self> {
        let user_prompt = conversation.last_user_message().ok_or_else(|| {
            RecollectError::InvalidInput(
                "The last message in the conversation must be a user message".to_string(),
            )
        })?;

        Ok(Self {
            user_prompt: user_prompt.clone(),
            steps: Vec::new(),
            max_iterations,
            current_iteration: 0,
            done: max_iterations == 0,
            satisfactory: false,
            final_summary: String::new(),
            generation_failed: false,
            summary_result_count: None,
        })
    }

    pub fn add_step(&mut self, step: RetrievalStep) {
        self.steps.push(step);
        self.current_iteration += 1;
        if self.current_iteration >= self.max_iterations {
            self.done = true;
        }
    }

    /// Nothing more to retrieve
    pub fn mark_satisfactory(&mut self) {
        self.satisfactory = true;
        self.done = true;
    }

    /// Query generation gave up; no step was added
    pub fn mark_generation_failed(&mut self) {
        self.generation_failed = true;
        self.satisfactory = false;
        self.done = true;
    }

    pub fn last_step(&self) -> Option<&RetrievalStep> {
        self.steps.last()
    }

    pub fn last_step_mut(&mut self) -> Option<&mut RetrievalStep> {
        self.steps.last_mut()
    }

    /// Whether the query generator asked for clarification before any
    /// retrieval happened
    pub fn needs_clarification(&self) -> bool {
        match self.steps.as_slice() {
            [only] => only.clarification_needed,
            [first, second] if first.is_pre_query => second.clarification_needed,
            _ => false,
        }
    }

    pub fn status(&self) -> RetrievalStatus {
        if self.needs_clarification() {
            RetrievalStatus::ClarificationNeeded
        } else if !self.done {
            RetrievalStatus::Active
        } else if self.generation_failed {
            RetrievalStatus::GenerationFailed
        } else if self.satisfactory {
            RetrievalStatus::Satisfactory
        } else {
            RetrievalStatus::IterationLimit
        }
    }

    /// Results of every step, one per memory with its best score, best first
    pub fn all_results(&self) -> Vec<MemoryResult> {
        dedup_by_memory(self.steps.iter().flat_map(|s| s.results.iter().cloned()))
    }

    fn result_count(&self) -> usize {
        self.steps.iter().map(|s| s.results.len()).sum()
    }

    /// Context for the response generator.
    ///
    /// Step summaries joined by newlines, or a bullet list of the retrieved
    /// memories when no step has a summary. The text is cached until the
    /// number of results changes or `force` is set.
    pub fn finalize(&mut self, force: bool) -> String {
        if self.needs_clarification() {
            return CLARIFICATION_PREFIX.to_string();
        }

        let count = self.result_count();
        if !force && !self.final_summary.is_empty() && self.summary_result_count == Some(count) {
            return self.final_summary.clone();
        }

        let summaries: Vec<&str> = self
            .steps
            .iter()
            .map(|s| s.summary.as_str())
            .filter(|s| !s.is_empty())
            .collect();

        self.final_summary = if summaries.is_empty() {
            let mut text = FALLBACK_HEADER.to_string();
            for result in self.steps.iter().flat_map(|s| &s.results) {
                text.push_str("- ");
                text.push_str(&result.memory.memory);
                text.push('\n');
            }
            text.push_str(FALLBACK_FOOTER);
            text
        } else {
            summaries.join("\n")
        };
        self.summary_result_count = Some(count);

        self.final_summary.clone()
    }
}
