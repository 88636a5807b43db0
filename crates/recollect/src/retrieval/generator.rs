//! LLM-driven query generation
//!
//! Turns the conversation, plus what earlier rounds already retrieved, into
//! the next [`RetrievalStep`].

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::conversation::{Conversation, Message, Role};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::llm::{Generator, GeneratorError, PromptTemplates, parse_json_object};
use crate::memory::TimeRelevance;
use crate::retrieval::query::{EntityQuery, Retrieval, RetrievalQuery, RetrievalStep};
use crate::util::parse_time_point;

/// Attempts before query generation is given up
pub const MAX_ATTEMPTS: usize = 3;

/// Default cap on queries per round
pub const DEFAULT_MAX_QUERIES: usize = 5;

/// Reply object the model is asked to produce
#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    clarification_needed: Option<bool>,
    #[serde(default)]
    queries: Option<Vec<ContextQuery>>,
}

#[derive(Debug, Deserialize)]
struct ContextQuery {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    time_relevance: Option<String>,
    #[serde(default)]
    time_point: Option<String>,
}

/// Generates retrieval queries with an LLM
pub struct QueryGenerator {
    generator: Arc<dyn Generator>,
    embedder: Arc<dyn Embedder>,
    templates: PromptTemplates,
    max_queries: usize,
}

impl QueryGenerator {
    pub fn new(generator: Arc<dyn Generator>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            generator,
            embedder,
            templates: PromptTemplates::default(),
            max_queries: DEFAULT_MAX_QUERIES,
        }
    }

    pub fn with_templates(mut self, templates: PromptTemplates) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_max_queries(mut self, max_queries: usize) -> Self {
        self.max_queries = max_queries.max(1);
        self
    }

    /// Add the next step to `retrieval`.
    ///
    /// A step without queries marks the retrieval satisfactory. When every
    /// attempt fails the retrieval is marked done and unsatisfactory without
    /// a new step. Errors only when the conversation does not end in a user
    /// message.
    pub async fn generate_queries(
        &self,
        conversation: &Conversation,
        retrieval: &mut Retrieval,
    ) -> Result<()> {
        let prompt = self.build_prompt(conversation, Some(retrieval))?;
        let primer = self.templates.query_primer();

        for attempt in 1..=MAX_ATTEMPTS {
            let step = self
                .generator
                .generate(&prompt, primer)
                .await
                .and_then(|reply| self.parse_response(&reply));

            match step {
                Ok(step) => {
                    debug!(
                        "Generated {} queries (clarification needed: {})",
                        step.queries.len(),
                        step.clarification_needed
                    );
                    let empty = step.queries.is_empty();
                    retrieval.add_step(step);
                    if empty {
                        retrieval.mark_satisfactory();
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Query generation attempt {}/{} failed: {}",
                        attempt, MAX_ATTEMPTS, e
                    );
                }
            }
        }

        error!("Failed to generate queries after {} attempts", MAX_ATTEMPTS);
        retrieval.mark_generation_failed();
        Ok(())
    }

    /// Prompt conversation: instructions, the conversation without system
    /// messages, then one assistant message per earlier step
    pub fn build_prompt(
        &self,
        conversation: &Conversation,
        retrieval: Option<&Retrieval>,
    ) -> Result<Conversation> {
        // Fails on a conversation not ending in a user message
        Retrieval::for_conversation(conversation, 0)?;

        let mut messages = vec![Message::system(
            self.templates.query_system_prompt(self.max_queries),
        )];
        messages.extend(
            conversation
                .messages
                .iter()
                .filter(|m| m.role != Role::System)
                .cloned(),
        );

        if let Some(retrieval) = retrieval {
            messages.extend(retrieval.steps.iter().map(render_step));
        }

        Ok(Conversation::from_messages(messages))
    }

    /// Read the queries out of a model reply
    fn parse_response(&self, reply: &Message) -> std::result::Result<RetrievalStep, GeneratorError> {
        let response: QueryResponse = parse_json_object(reply.message_text())?;
        if response.queries.is_none() && response.clarification_needed.is_none() {
            return Err(GeneratorError::ParseError(
                "Reply has neither 'queries' nor 'clarification_needed'".to_string(),
            ));
        }

        let mut step = RetrievalStep {
            reasoning: reply.reasoning_text().trim().to_string(),
            clarification_needed: response.clarification_needed.unwrap_or(false),
            ..RetrievalStep::default()
        };

        let candidates: Vec<ContextQuery> = response
            .queries
            .unwrap_or_default()
            .into_iter()
            .filter(|q| q.query.as_deref().is_some_and(|t| !t.trim().is_empty()))
            .take(self.max_queries)
            .collect();

        for candidate in &candidates {
            match self.to_retrieval_query(candidate) {
                Ok(query) => step.queries.push(query),
                Err(e) => warn!("Skipping generated query: {}", e),
            }
        }

        if step.queries.is_empty() && !candidates.is_empty() {
            return Err(GeneratorError::ParseError(
                "None of the generated queries could be converted".to_string(),
            ));
        }

        Ok(step)
    }

    fn to_retrieval_query(&self, candidate: &ContextQuery) -> Result<RetrievalQuery> {
        let text = candidate.query.as_deref().unwrap_or_default();
        let mut time_relevance =
            TimeRelevance::parse(candidate.time_relevance.as_deref().unwrap_or("UNKNOWN"));
        let timestamp = parse_time_point(candidate.time_point.as_deref().unwrap_or("UNKNOWN"));

        if timestamp.is_none() && time_relevance != TimeRelevance::Always {
            time_relevance = TimeRelevance::Unknown;
        }

        let query = RetrievalQuery::from_text(
            text,
            self.embedder.as_ref(),
            EntityQuery::from_entities(&candidate.entities, 1.0),
            1.0,
            time_relevance,
            timestamp,
        )?;
        Ok(match candidate.topic.as_deref().map(str::trim) {
            Some(topic) if !topic.is_empty() => query.with_topic(topic),
            _ => query,
        })
    }
}

/// Earlier step as an assistant turn, so the model sees what it already has
fn render_step(step: &RetrievalStep) -> Message {
    let mut results: Vec<_> = step.results.iter().collect();
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut lines = vec!["Retrieved Context:".to_string()];
    for result in results {
        let memory = &result.memory;
        if memory.memory.is_empty() {
            continue;
        }
        let source = if memory.source.is_unknown() {
            "unknown".to_string()
        } else {
            memory.source.to_string()
        };
        lines.push(format!("- {} (source: {})", memory.memory, source));
    }

    let message = Message::assistant(lines.join("\n"));
    if step.reasoning.is_empty() {
        message
    } else {
        message.with_reasoning(step.reasoning.clone())
    }
}
