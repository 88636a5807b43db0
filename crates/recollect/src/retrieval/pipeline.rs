//! Iterative retrieval loop
//!
//! Each round generates queries, runs them against the store and has the
//! evaluator keep what is relevant. The loop ends when the generator has
//! nothing left to ask, asks the user for clarification, the evaluator says
//! the question is fully answered, or the iteration cap is hit. The collected
//! context is then appended to the conversation as assistant reasoning.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::RetrievalConfig;
use crate::conversation::{Conversation, Message};
use crate::embedding::Embedder;
use crate::error::{RecollectError, Result};
use crate::llm::{Generator, PromptTemplates};
use crate::memory::types::{FeedbackType, MemoryFeedback};
use crate::retrieval::evaluator::{MemoryEvaluator, MemoryRelevance};
use crate::retrieval::generator::QueryGenerator;
use crate::retrieval::query::{Retrieval, RetrievalStatus, RetrievalStep};
use crate::retrieval::retriever::Retriever;
use crate::storage::GraphMemoryStore;

const UPDATE_CHANNEL_SIZE: usize = 32;

/// Stage the pipeline is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    QueryGeneration,
    QueryUpdate,
    Retrieval,
    RetrievalUpdate,
    Evaluation,
    ResponseGeneration,
    Completed,
    Error,
}

/// Progress event for a UI following the loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineUpdate {
    pub status: PipelineStatus,
    pub message: String,
    /// Rough completion in 0..=1
    pub progress: f32,
    pub step: Option<RetrievalStep>,
}

impl PipelineUpdate {
    fn new(status: PipelineStatus, message: impl Into<String>, progress: f32) -> Self {
        Self {
            status,
            message: message.into(),
            progress: progress.clamp(0.0, 1.0),
            step: None,
        }
    }

    fn with_step(mut self, step: &RetrievalStep) -> Self {
        self.step = Some(step.clone());
        self
    }
}

/// Result of one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Text appended to the conversation as reasoning
    pub context: String,
    pub retrieval: Retrieval,
    pub status: RetrievalStatus,
    /// Set when the loop ended on a failure; `context` is still usable
    pub error: Option<String>,
}

/// Stops a pipeline before its next round
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle(Arc<AtomicBool>);

impl CancellationHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Allow the pipeline to run again after a cancellation
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Clears the in-progress flag when a run ends, however it ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives query generation, retrieval and evaluation for one conversation
/// turn at a time
pub struct RetrievalPipeline {
    store: Arc<dyn GraphMemoryStore>,
    generator: Arc<dyn Generator>,
    query_generator: QueryGenerator,
    retriever: Retriever,
    evaluator: MemoryEvaluator,
    max_iterations: usize,
    top_k: usize,
    relevance_threshold: MemoryRelevance,
    in_progress: AtomicBool,
    cancellation: CancellationHandle,
}

impl RetrievalPipeline {
    pub fn new(
        store: Arc<dyn GraphMemoryStore>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        config: &RetrievalConfig,
        templates: PromptTemplates,
    ) -> Self {
        let query_generator = QueryGenerator::new(generator.clone(), embedder)
            .with_templates(templates.clone())
            .with_max_queries(config.max_queries);
        let evaluator =
            MemoryEvaluator::new(generator.clone(), templates, config.evaluation_history);

        Self {
            retriever: Retriever::new(store.clone(), config),
            store,
            generator,
            query_generator,
            evaluator,
            max_iterations: config.max_iterations,
            top_k: config.top_k,
            relevance_threshold: MemoryRelevance::parse(&config.relevance_threshold),
            in_progress: AtomicBool::new(false),
            cancellation: CancellationHandle::default(),
        }
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancellation.clone()
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Run the retrieval loop for the conversation's last user message and
    /// append the collected context to `conversation`.
    ///
    /// Fails when the last message is not from the user or when the pipeline
    /// is already running. Generation failures do not fail the run; they are
    /// reported in [`PipelineOutcome::error`].
    pub async fn run(&self, conversation: &mut Conversation) -> Result<PipelineOutcome> {
        self.run_with_updates(conversation, None).await
    }

    /// Run on a background task, streaming progress. The last update is
    /// `Completed` with the context as its message, or `Error`.
    pub fn stream(self: Arc<Self>, conversation: Conversation) -> ReceiverStream<PipelineUpdate> {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_SIZE);

        tokio::spawn(async move {
            let mut conversation = conversation;
            if let Err(e) = self.run_with_updates(&mut conversation, Some(&tx)).await {
                let _ = tx
                    .send(PipelineUpdate::new(PipelineStatus::Error, e.to_string(), 1.0))
                    .await;
            }
        });

        ReceiverStream::new(rx)
    }

    /// Generate the assistant reply, continuing from the context reasoning a
    /// previous [`run`](Self::run) appended. The reasoning message is
    /// replaced by the reply.
    pub async fn respond(&self, conversation: &mut Conversation) -> Result<Message> {
        let reply = self.generator.generate(conversation, None).await?;

        if conversation.ends_with_reasoning() {
            conversation.messages.pop();
        }
        conversation.push(reply.clone());
        Ok(reply)
    }

    /// Record how useful surfaced memories were
    pub async fn record_feedback(&self, feedback: &[MemoryFeedback]) -> Result<()> {
        let mut by_kind: HashMap<FeedbackType, Vec<String>> = HashMap::new();
        for item in feedback {
            by_kind
                .entry(item.feedback)
                .or_default()
                .push(item.memory_id.clone());
        }

        for (kind, ids) in &by_kind {
            let updated = self.store.update_memory_access(ids, *kind).await?;
            debug!("Recorded {} feedback for {} memories", kind.as_str(), updated.len());
        }

        for item in feedback.iter().filter(|f| !f.entities.is_empty()) {
            self.store
                .apply_entity_feedback(&item.memory_id, &item.entities, item.feedback)
                .await?;
        }
        Ok(())
    }

    fn try_start(&self) -> Result<RunGuard<'_>> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(RecollectError::Retrieval(
                "A retrieval is already in progress".to_string(),
            ));
        }
        Ok(RunGuard(&self.in_progress))
    }

    async fn run_with_updates(
        &self,
        conversation: &mut Conversation,
        updates: Option<&mpsc::Sender<PipelineUpdate>>,
    ) -> Result<PipelineOutcome> {
        let _guard = self.try_start()?;
        let mut retrieval = Retrieval::for_conversation(conversation, self.max_iterations)?;
        let mut error = None;

        while !retrieval.done {
            if self.cancellation.is_cancelled() {
                info!("Retrieval cancelled after {} rounds", retrieval.current_iteration);
                break;
            }

            let round = retrieval.current_iteration + 1;
            let progress = |offset: f32| {
                (retrieval_progress(round - 1, self.max_iterations) + offset / self.max_iterations as f32)
                    .min(1.0)
            };

            emit(
                updates,
                PipelineUpdate::new(
                    PipelineStatus::QueryGeneration,
                    format!("Generating queries (round {round})"),
                    progress(0.0),
                ),
            )
            .await;

            self.query_generator
                .generate_queries(conversation, &mut retrieval)
                .await?;

            if retrieval.status() == RetrievalStatus::GenerationFailed {
                let message = "Query generation failed".to_string();
                warn!("{}", message);
                emit(
                    updates,
                    PipelineUpdate::new(PipelineStatus::Error, message.clone(), progress(0.25)),
                )
                .await;
                error = Some(message);
                break;
            }

            let Some(mut step) = retrieval.last_step().cloned() else {
                break;
            };

            emit(
                updates,
                PipelineUpdate::new(
                    PipelineStatus::QueryUpdate,
                    format!("Generated {} queries", step.queries.len()),
                    progress(0.25),
                )
                .with_step(&step),
            )
            .await;

            if step.clarification_needed || step.queries.is_empty() {
                break;
            }

            emit(
                updates,
                PipelineUpdate::new(PipelineStatus::Retrieval, "Retrieving memories", progress(0.4)),
            )
            .await;

            step.results = self.retriever.retrieve(&step, self.top_k).await;

            emit(
                updates,
                PipelineUpdate::new(
                    PipelineStatus::RetrievalUpdate,
                    format!("Retrieved {} memories", step.results.len()),
                    progress(0.6),
                )
                .with_step(&step),
            )
            .await;

            let mut fully_answered = false;
            if !step.results.is_empty() {
                emit(
                    updates,
                    PipelineUpdate::new(
                        PipelineStatus::Evaluation,
                        "Evaluating memories",
                        progress(0.75),
                    ),
                )
                .await;

                if let Some(evaluation) = self.evaluator.evaluate_memories(&step, conversation).await {
                    step.results = evaluation.relevant_results(self.relevance_threshold);
                    step.summary = evaluation.summary.clone();
                    fully_answered = evaluation.fully_answered;
                    self.connect(&step).await;
                }
            }

            if let Some(last) = retrieval.last_step_mut() {
                *last = step;
            }
            if fully_answered {
                retrieval.mark_satisfactory();
            }
        }

        emit(
            updates,
            PipelineUpdate::new(PipelineStatus::ResponseGeneration, "Preparing context", 0.95),
        )
        .await;

        let context = retrieval.finalize(false);
        conversation.add_context_as_reasoning(&context);

        let status = retrieval.status();
        info!(
            "Retrieval finished after {} rounds ({:?}, {} memories)",
            retrieval.current_iteration,
            status,
            retrieval.all_results().len()
        );

        emit(
            updates,
            PipelineUpdate::new(PipelineStatus::Completed, context.clone(), 1.0),
        )
        .await;

        Ok(PipelineOutcome {
            context,
            retrieval,
            status,
            error,
        })
    }

    /// Link the memories that proved relevant together
    async fn connect(&self, step: &RetrievalStep) {
        if step.results.len() < 2 {
            return;
        }
        let ids: Vec<String> = step.results.iter().map(|r| r.memory.id.clone()).collect();
        if let Err(e) = self.store.connect_memories(&ids).await {
            warn!("Failed to connect relevant memories: {}", e);
        }
    }
}

fn retrieval_progress(round: usize, max_iterations: usize) -> f32 {
    if max_iterations == 0 {
        return 1.0;
    }
    round as f32 / max_iterations as f32
}

async fn emit(updates: Option<&mpsc::Sender<PipelineUpdate>>, update: PipelineUpdate) {
    if let Some(tx) = updates {
        // receiver gone means nobody is listening any more
        let _ = tx.send(update).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::Embedder;
    use crate::memory::Memory;
    use crate::retrieval::query::CLARIFICATION_PREFIX;
    use crate::storage::InMemoryGraphStore;
    use crate::testing::{MockEmbedder, ScriptedGenerator};
    use futures::StreamExt;

    const FERRIS_QUERIES: &str = r#"{"clarification_needed": false, "queries": [{"query": "Ferris the crab", "entities": ["Ferris"], "time_relevance": "ALWAYS", "time_point": "UNKNOWN"}]}"#;

    const RATE_TWO_RELEVANT: &str = r#"{"evaluations_list": [
        {"memory_id_int": 1, "short_feedback_str": "", "memory_keywords_list": ["Ferris"], "relevance_str": "RELEVANT"},
        {"memory_id_int": 2, "short_feedback_str": "", "memory_keywords_list": ["Ferris"], "relevance_str": "RELEVANT"},
        {"memory_id_int": 3, "short_feedback_str": "", "memory_keywords_list": [], "relevance_str": "NONSENSE"}
    ], "summary_str": "Ferris is the crab mascot of Rust.", "missing_keywords_list": [], "fully_answered_bool": false}"#;

    const NO_QUERIES: &str = r#"{"clarification_needed": false, "queries": []}"#;

    async fn seeded_store() -> Arc<InMemoryGraphStore> {
        let store = Arc::new(InMemoryGraphStore::new());
        let memories: Vec<Memory> = [
            ("mascot", "Ferris is the Rust mascot", vec!["Ferris", "Rust"]),
            ("crab", "Ferris is an orange crab", vec!["Ferris"]),
            ("tomato", "Tomatoes need full sun", vec!["Tomato"]),
        ]
        .into_iter()
        .map(|(id, text, entities)| {
            Memory::new(text)
                .with_id(id)
                .with_entities(&entities)
                .with_embedding(MockEmbedder.embed(text).unwrap())
        })
        .collect();
        store.add_memory_batch(&memories).await.unwrap();
        store
    }

    fn pipeline(store: Arc<InMemoryGraphStore>, generator: Arc<ScriptedGenerator>) -> RetrievalPipeline {
        RetrievalPipeline::new(
            store,
            Arc::new(MockEmbedder),
            generator,
            &RetrievalConfig::default(),
            PromptTemplates::default(),
        )
    }

    fn conversation() -> Conversation {
        Conversation::from_messages(vec![Message::user("Who is Ferris?")])
    }

    #[tokio::test]
    async fn test_loop_until_no_more_queries() {
        let store = seeded_store().await;
        let generator = Arc::new(ScriptedGenerator::new([
            FERRIS_QUERIES,
            RATE_TWO_RELEVANT,
            NO_QUERIES,
        ]));
        let pipeline = pipeline(store.clone(), generator.clone());
        let mut conversation = conversation();

        let outcome = pipeline.run(&mut conversation).await.unwrap();

        assert_eq!(generator.calls(), 3);
        assert_eq!(outcome.status, RetrievalStatus::Satisfactory);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.context, "Ferris is the crab mascot of Rust.");
        assert_eq!(outcome.retrieval.steps.len(), 2);

        let kept: Vec<&str> = outcome.retrieval.steps[0]
            .results
            .iter()
            .map(|r| r.memory.memory.as_str())
            .collect();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|m| m.starts_with("Ferris")));

        // relevant memories are linked
        let related = store.query_related_memories("mascot", 5).await.unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].memory.id, "crab");

        assert!(conversation.ends_with_reasoning());
        assert_eq!(
            conversation.last().unwrap().reasoning_text(),
            "Ferris is the crab mascot of Rust."
        );
        assert!(!pipeline.is_running());
    }

    #[tokio::test]
    async fn test_fully_answered_stops_early() {
        let store = seeded_store().await;
        let answered = RATE_TWO_RELEVANT.replace(
            r#""fully_answered_bool": false"#,
            r#""fully_answered_bool": true"#,
        );
        let generator = Arc::new(ScriptedGenerator::new([FERRIS_QUERIES.to_string(), answered]));
        let pipeline = pipeline(store, generator.clone());

        let outcome = pipeline.run(&mut conversation()).await.unwrap();
        assert_eq!(generator.calls(), 2);
        assert_eq!(outcome.status, RetrievalStatus::Satisfactory);
        assert_eq!(outcome.retrieval.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_iteration_cap() {
        let store = seeded_store().await;
        let generator = Arc::new(ScriptedGenerator::new([
            FERRIS_QUERIES,
            "unparseable evaluation",
            FERRIS_QUERIES,
            "unparseable evaluation",
            FERRIS_QUERIES,
            "unparseable evaluation",
            FERRIS_QUERIES,
        ]));
        let pipeline = pipeline(store, generator.clone());

        let outcome = pipeline.run(&mut conversation()).await.unwrap();
        assert_eq!(outcome.retrieval.steps.len(), 3);
        assert_eq!(generator.calls(), 6);
        assert_eq!(outcome.status, RetrievalStatus::IterationLimit);
        // without summaries the context lists the raw memories
        assert!(outcome.context.starts_with("Okay, this is what I know:\n- "));
    }

    #[tokio::test]
    async fn test_generation_failure_still_finalizes() {
        let store = seeded_store().await;
        let generator = Arc::new(ScriptedGenerator::new(["nope", "still nope", "no"]));
        let pipeline = pipeline(store, generator);
        let mut conversation = conversation();

        let outcome = pipeline.run(&mut conversation).await.unwrap();
        assert_eq!(outcome.status, RetrievalStatus::GenerationFailed);
        assert!(outcome.error.is_some());
        assert!(outcome.context.starts_with("Okay, this is what I know:"));
        assert!(conversation.ends_with_reasoning());
    }

    #[tokio::test]
    async fn test_clarification_skips_retrieval() {
        let store = seeded_store().await;
        let generator = Arc::new(ScriptedGenerator::new([r#"{"clarification_needed": true, "queries": []}"#]));
        let pipeline = pipeline(store, generator.clone());

        let outcome = pipeline.run(&mut conversation()).await.unwrap();
        assert_eq!(generator.calls(), 1);
        assert_eq!(outcome.status, RetrievalStatus::ClarificationNeeded);
        assert_eq!(outcome.context, CLARIFICATION_PREFIX);
    }

    #[tokio::test]
    async fn test_rejects_non_user_turn_and_concurrent_runs() {
        let store = seeded_store().await;
        let generator = Arc::new(ScriptedGenerator::new([NO_QUERIES]));
        let pipeline = pipeline(store, generator);

        let mut conversation = conversation();
        conversation.push(Message::assistant("Ferris is a crab."));
        let err = pipeline.run(&mut conversation).await.unwrap_err();
        assert!(matches!(err, RecollectError::InvalidInput(_)));
        assert!(!pipeline.is_running());

        let guard = pipeline.try_start().unwrap();
        let err = pipeline.run(&mut self::conversation()).await.unwrap_err();
        assert!(matches!(err, RecollectError::Retrieval(_)));
        drop(guard);

        assert!(pipeline.run(&mut self::conversation()).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_pipeline_runs_no_rounds() {
        let store = seeded_store().await;
        let generator = Arc::new(ScriptedGenerator::new([FERRIS_QUERIES]));
        let pipeline = pipeline(store, generator.clone());

        pipeline.cancellation_handle().cancel();
        let outcome = pipeline.run(&mut conversation()).await.unwrap();
        assert_eq!(generator.calls(), 0);
        assert!(outcome.retrieval.steps.is_empty());
    }

    #[tokio::test]
    async fn test_stream_reports_progress() {
        let store = seeded_store().await;
        let generator = Arc::new(ScriptedGenerator::new([
            FERRIS_QUERIES,
            RATE_TWO_RELEVANT,
            NO_QUERIES,
        ]));
        let pipeline = Arc::new(pipeline(store, generator));

        let updates: Vec<PipelineUpdate> = pipeline.stream(conversation()).collect().await;
        let statuses: Vec<PipelineStatus> = updates.iter().map(|u| u.status).collect();

        assert_eq!(statuses.first(), Some(&PipelineStatus::QueryGeneration));
        assert!(statuses.contains(&PipelineStatus::RetrievalUpdate));
        assert!(statuses.contains(&PipelineStatus::Evaluation));
        let last = updates.last().unwrap();
        assert_eq!(last.status, PipelineStatus::Completed);
        assert_eq!(last.message, "Ferris is the crab mascot of Rust.");
        assert!(updates.windows(2).all(|w| w[0].progress <= w[1].progress));
    }

    #[tokio::test]
    async fn test_respond_replaces_context_reasoning() {
        let store = seeded_store().await;
        let generator = Arc::new(ScriptedGenerator::new([NO_QUERIES, "Ferris is Rust's crab."]));
        let pipeline = pipeline(store, generator);
        let mut conversation = conversation();

        pipeline.run(&mut conversation).await.unwrap();
        assert_eq!(conversation.len(), 2);

        let reply = pipeline.respond(&mut conversation).await.unwrap();
        assert_eq!(reply.content, "Ferris is Rust's crab.");
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.last().unwrap().content, "Ferris is Rust's crab.");
    }

    #[tokio::test]
    async fn test_record_feedback() {
        let store = seeded_store().await;
        let pipeline = pipeline(store.clone(), Arc::new(ScriptedGenerator::new(Vec::<String>::new())));

        pipeline
            .record_feedback(&[
                MemoryFeedback::new("mascot", FeedbackType::Positive).with_entities(&["Crab"]),
                MemoryFeedback::new("tomato", FeedbackType::Negative),
                MemoryFeedback::new("missing", FeedbackType::Positive),
            ])
            .await
            .unwrap();

        let memories = store
            .query_memories_by_id(&["mascot".to_string(), "tomato".to_string()])
            .await
            .unwrap();
        let mascot = memories.iter().find(|m| m.id == "mascot").unwrap();
        let tomato = memories.iter().find(|m| m.id == "tomato").unwrap();
        assert_eq!(mascot.positive_access_count, 1);
        assert_eq!(tomato.negative_access_count, 1);

        let crab = store.get_entity("crab").await.unwrap().unwrap();
        assert_eq!(crab.mention_count, 1);
    }
}
