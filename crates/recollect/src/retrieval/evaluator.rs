//! Memory evaluation
//!
//! After a round of retrieval the evaluator asks the model to rate every
//! retrieved memory against the queries and the conversation, and to
//! summarise what the relevant ones say. Every input memory gets exactly one
//! rating, whatever the model returns.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::conversation::{Conversation, Message};
use crate::error::Result;
use crate::llm::{Generator, PromptTemplates, generate_object};
use crate::memory::types::normalize_entity;
use crate::retrieval::query::{MemoryResult, RetrievalStep};

/// Evaluation is requested once; a bad reply just skips evaluation
const EVALUATION_ATTEMPTS: usize = 1;

const EVALUATION_REQUEST: &str = "Evaluate the following memories based on their relevance to the queries and the previous conversation context.\n";

/// How relevant a memory is to the current turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemoryRelevance {
    /// The model gave no usable rating
    #[default]
    Unknown,
    Nonsense,
    Irrelevant,
    Supporting,
    Relevant,
    Perfect,
}

impl MemoryRelevance {
    pub const ALL: [MemoryRelevance; 6] = [
        MemoryRelevance::Unknown,
        MemoryRelevance::Nonsense,
        MemoryRelevance::Irrelevant,
        MemoryRelevance::Supporting,
        MemoryRelevance::Relevant,
        MemoryRelevance::Perfect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryRelevance::Unknown => "UNKNOWN",
            MemoryRelevance::Nonsense => "NONSENSE",
            MemoryRelevance::Irrelevant => "IRRELEVANT",
            MemoryRelevance::Supporting => "SUPPORTING",
            MemoryRelevance::Relevant => "RELEVANT",
            MemoryRelevance::Perfect => "PERFECT",
        }
    }

    /// Case-insensitive parse; anything unrecognised is `Unknown`
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .unwrap_or(MemoryRelevance::Unknown)
    }

    /// Rank of a memory's own rating. Unrated memories rank highest so they
    /// are never filtered out.
    pub fn rank(&self) -> u8 {
        match self {
            MemoryRelevance::Nonsense => 0,
            MemoryRelevance::Irrelevant => 1,
            MemoryRelevance::Supporting => 2,
            MemoryRelevance::Relevant => 3,
            MemoryRelevance::Perfect => 4,
            MemoryRelevance::Unknown => 5,
        }
    }

    /// Rank used when this value is a threshold; `Unknown` lets everything
    /// through
    pub fn threshold_rank(&self) -> u8 {
        match self {
            MemoryRelevance::Unknown => 0,
            other => other.rank(),
        }
    }

    pub fn meets(&self, threshold: MemoryRelevance) -> bool {
        self.rank() >= threshold.threshold_rank()
    }
}

impl fmt::Display for MemoryRelevance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One evaluated memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatedMemory {
    pub result: MemoryResult,
    pub relevance: MemoryRelevance,
    pub feedback: String,
    /// Normalised keywords the model associated with the memory
    pub keywords: Vec<String>,
}

/// Outcome of evaluating one step's results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub summary: String,
    /// One entry per evaluated memory, in input order
    pub memories: Vec<RatedMemory>,
    pub missing_keywords: Vec<String>,
    pub fully_answered: bool,
}

impl Evaluation {
    /// Memories rated at or above `threshold`
    pub fn get_relevant_memories(&self, threshold: MemoryRelevance) -> Vec<&RatedMemory> {
        self.memories
            .iter()
            .filter(|m| m.relevance.meets(threshold))
            .collect()
    }

    /// Results of the memories rated at or above `threshold`
    pub fn relevant_results(&self, threshold: MemoryRelevance) -> Vec<MemoryResult> {
        self.get_relevant_memories(threshold)
            .into_iter()
            .map(|m| m.result.clone())
            .collect()
    }
}

/// Reply object the model is asked to produce
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvaluationResult {
    #[serde(default)]
    pub evaluations_list: Vec<MemoryEvaluation>,
    #[serde(default)]
    pub summary_str: String,
    #[serde(default)]
    pub missing_keywords_list: Vec<String>,
    #[serde(default)]
    pub fully_answered_bool: bool,
}

/// Model rating for one numbered memory
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryEvaluation {
    /// 1-based position in the request
    pub memory_id_int: i64,
    #[serde(default)]
    pub short_feedback_str: String,
    #[serde(default)]
    pub memory_keywords_list: Vec<String>,
    #[serde(default)]
    pub relevance_str: String,
}

#[derive(Serialize)]
struct EvaluationRequest<'a> {
    queries: Vec<QueryEntry<'a>>,
    memories: Vec<MemoryEntry<'a>>,
}

#[derive(Serialize)]
struct QueryEntry<'a> {
    query: &'a str,
    keywords: Vec<&'a str>,
}

#[derive(Serialize)]
struct MemoryEntry<'a> {
    memory_id_int: usize,
    content_str: &'a str,
    keywords_list: Vec<&'a str>,
}

/// Rates retrieved memories with an LLM
pub struct MemoryEvaluator {
    generator: Arc<dyn Generator>,
    templates: PromptTemplates,
    history: usize,
}

impl MemoryEvaluator {
    /// `history` is the number of trailing conversation messages shown to
    /// the model
    pub fn new(generator: Arc<dyn Generator>, templates: PromptTemplates, history: usize) -> Self {
        Self {
            generator,
            templates,
            history,
        }
    }

    /// Rate the step's results. `None` when there is nothing to evaluate or
    /// the model reply is unusable.
    pub async fn evaluate_memories(
        &self,
        step: &RetrievalStep,
        conversation: &Conversation,
    ) -> Option<Evaluation> {
        if step.results.is_empty() || step.queries.is_empty() {
            return None;
        }

        let prompt = match self.build_prompt(step, conversation) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!("Failed to build evaluation prompt: {}", e);
                return None;
            }
        };

        let reply = generate_object::<EvaluationResult>(
            self.generator.as_ref(),
            &prompt,
            self.templates.evaluation_primer(),
            EVALUATION_ATTEMPTS,
        )
        .await;

        match reply {
            Ok((message, result)) => {
                debug!("Evaluation reasoning: {}", message.reasoning_text());
                Some(parse_evaluation_result(result, &step.results))
            }
            Err(e) => {
                warn!("Memory evaluation failed: {}", e);
                None
            }
        }
    }

    /// Instructions, recent conversation, then the numbered memories as JSON
    pub fn build_prompt(
        &self,
        step: &RetrievalStep,
        conversation: &Conversation,
    ) -> Result<Conversation> {
        let request = EvaluationRequest {
            queries: step
                .queries
                .iter()
                .filter_map(|q| {
                    q.query_text().map(|query| QueryEntry {
                        query,
                        keywords: q.entity_names(),
                    })
                })
                .collect(),
            memories: step
                .results
                .iter()
                .enumerate()
                .map(|(i, r)| MemoryEntry {
                    memory_id_int: i + 1,
                    content_str: &r.memory.memory,
                    keywords_list: r.memory.entity_names(),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&request)?;

        let mut messages = vec![Message::system(self.templates.evaluation_system_prompt())];
        messages.extend(conversation.recent(self.history).into_iter().cloned());
        messages.push(Message::user(format!("{EVALUATION_REQUEST}{json}")));

        Ok(Conversation::from_messages(messages))
    }
}

/// Map the model's ratings back onto `results`.
///
/// Out-of-range ids are dropped, the first rating of a duplicated id wins,
/// and memories the model skipped are rated `Unknown`.
pub fn parse_evaluation_result(result: EvaluationResult, results: &[MemoryResult]) -> Evaluation {
    let mut by_index: HashMap<usize, MemoryEvaluation> = HashMap::new();

    for evaluation in result.evaluations_list {
        let id = evaluation.memory_id_int;
        if id < 1 || id as usize > results.len() {
            warn!(
                "Evaluation references memory {} outside 1..={}, dropping it",
                id,
                results.len()
            );
            continue;
        }
        by_index.entry(id as usize - 1).or_insert(evaluation);
    }

    let memories = results
        .iter()
        .enumerate()
        .map(|(i, result)| match by_index.remove(&i) {
            Some(evaluation) => RatedMemory {
                result: result.clone(),
                relevance: MemoryRelevance::parse(&evaluation.relevance_str),
                feedback: evaluation.short_feedback_str,
                keywords: normalize_keywords(&evaluation.memory_keywords_list),
            },
            None => RatedMemory {
                result: result.clone(),
                relevance: MemoryRelevance::Unknown,
                feedback: String::new(),
                keywords: Vec::new(),
            },
        })
        .collect();

    Evaluation {
        summary: result.summary_str.trim().to_string(),
        memories,
        missing_keywords: normalize_keywords(&result.missing_keywords_list),
        fully_answered: result.fully_answered_bool,
    }
}

fn normalize_keywords(keywords: &[String]) -> Vec<String> {
    keywords
        .iter()
        .map(|k| normalize_entity(k))
        .filter(|k| !k.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::prompts::EVALUATION_REPLY_BEGINNING;
    use crate::memory::{Memory, TimeRelevance};
    use crate::retrieval::query::RetrievalQuery;
    use crate::testing::{MockEmbedder, ScriptedGenerator};

    fn step() -> RetrievalStep {
        let query = RetrievalQuery::from_text(
            "What is a zero-knowledge proof?",
            &MockEmbedder,
            vec![],
            1.0,
            TimeRelevance::Unknown,
            None,
        )
        .unwrap();
        let mut step = RetrievalStep::new(vec![query]);
        step.results = (1..=3)
            .map(|i| {
                MemoryResult::new(
                    Memory::new(format!("memory {i}")).with_id(format!("m{i}")),
                    1.0 / i as f32,
                    "q",
                )
            })
            .collect();
        step
    }

    fn conversation() -> Conversation {
        Conversation::from_messages(vec![
            Message::system("ignored"),
            Message::user("Explain zero-knowledge proofs"),
        ])
    }

    fn evaluation(id: i64, relevance: &str) -> MemoryEvaluation {
        MemoryEvaluation {
            memory_id_int: id,
            short_feedback_str: format!("feedback {id}"),
            memory_keywords_list: vec!["Zero Knowledge".to_string()],
            relevance_str: relevance.to_string(),
        }
    }

    #[test]
    fn test_relevance_parse_and_order() {
        assert_eq!(MemoryRelevance::parse("perfect"), MemoryRelevance::Perfect);
        assert_eq!(MemoryRelevance::parse(" Supporting "), MemoryRelevance::Supporting);
        assert_eq!(MemoryRelevance::parse("somewhat"), MemoryRelevance::Unknown);

        assert!(MemoryRelevance::Relevant.meets(MemoryRelevance::Supporting));
        assert!(!MemoryRelevance::Irrelevant.meets(MemoryRelevance::Supporting));
        // unrated memories always pass, an unknown threshold passes everything
        assert!(MemoryRelevance::Unknown.meets(MemoryRelevance::Perfect));
        assert!(MemoryRelevance::Nonsense.meets(MemoryRelevance::Unknown));
    }

    #[test]
    fn test_parse_keeps_every_input_memory() {
        let results = step().results;
        let result = EvaluationResult {
            evaluations_list: vec![
                evaluation(3, "PERFECT"),
                evaluation(7, "RELEVANT"),
                evaluation(0, "RELEVANT"),
                evaluation(3, "NONSENSE"),
                evaluation(1, "irrelevant"),
            ],
            summary_str: "  ZKPs prove knowledge without revealing it. ".to_string(),
            missing_keywords_list: vec!["Fiat Shamir".to_string(), " ".to_string()],
            fully_answered_bool: true,
        };

        let parsed = parse_evaluation_result(result, &results);
        assert_eq!(parsed.memories.len(), results.len());
        let ids: Vec<&str> = parsed.memories.iter().map(|m| m.result.memory.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);

        let ratings: Vec<MemoryRelevance> = parsed.memories.iter().map(|m| m.relevance).collect();
        assert_eq!(
            ratings,
            vec![
                MemoryRelevance::Irrelevant,
                MemoryRelevance::Unknown,
                MemoryRelevance::Perfect,
            ]
        );
        assert_eq!(parsed.memories[2].feedback, "feedback 3");
        assert_eq!(parsed.memories[2].keywords, vec!["zero-knowledge"]);
        assert_eq!(parsed.summary, "ZKPs prove knowledge without revealing it.");
        assert_eq!(parsed.missing_keywords, vec!["fiat-shamir"]);
        assert!(parsed.fully_answered);

        let relevant = parsed.get_relevant_memories(MemoryRelevance::Supporting);
        let ids: Vec<&str> = relevant.iter().map(|m| m.result.memory.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
    }

    #[test]
    fn test_parse_empty_reply_backfills() {
        let results = step().results;
        let parsed = parse_evaluation_result(EvaluationResult::default(), &results);
        assert_eq!(parsed.memories.len(), 3);
        assert!(parsed.memories.iter().all(|m| m.relevance == MemoryRelevance::Unknown));
        assert!(!parsed.fully_answered);
    }

    #[test]
    fn test_prompt_lists_numbered_memories() {
        let evaluator = MemoryEvaluator::new(
            Arc::new(ScriptedGenerator::new(Vec::<String>::new())),
            PromptTemplates::default(),
            10,
        );
        let prompt = evaluator.build_prompt(&step(), &conversation()).unwrap();

        assert_eq!(prompt.len(), 3);
        assert_eq!(prompt.messages[1].content, "Explain zero-knowledge proofs");

        let request = prompt.messages[2].content.clone();
        let json = request.strip_prefix(EVALUATION_REQUEST).unwrap();
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["queries"][0]["query"], "What is a zero-knowledge proof?");
        assert_eq!(value["memories"][0]["memory_id_int"], 1);
        assert_eq!(value["memories"][2]["content_str"], "memory 3");
    }

    #[tokio::test]
    async fn test_evaluate_memories() {
        let generator = Arc::new(ScriptedGenerator::new([r#"</think>
{
  "evaluations_list": [
    {"memory_id_int": 1, "short_feedback_str": "on topic", "memory_keywords_list": ["zkp"], "relevance_str": "PERFECT"},
    {"memory_id_int": 2, "short_feedback_str": "off topic", "memory_keywords_list": [], "relevance_str": "NONSENSE"}
  ],
  "summary_str": "A ZKP proves a statement without revealing why it is true.",
  "missing_keywords_list": [],
  "fully_answered_bool": false
}"#]));
        let evaluator = MemoryEvaluator::new(generator.clone(), PromptTemplates::default(), 4);

        let evaluation = evaluator
            .evaluate_memories(&step(), &conversation())
            .await
            .unwrap();
        assert_eq!(evaluation.memories.len(), 3);
        assert_eq!(evaluation.memories[0].relevance, MemoryRelevance::Perfect);
        assert_eq!(evaluation.memories[2].relevance, MemoryRelevance::Unknown);
        assert_eq!(
            evaluation.summary,
            "A ZKP proves a statement without revealing why it is true."
        );

        let relevant = evaluation.relevant_results(MemoryRelevance::Supporting);
        assert_eq!(relevant.len(), 2);

        let (_, primer) = &generator.prompts()[0];
        assert_eq!(primer.as_deref(), Some(EVALUATION_REPLY_BEGINNING));
    }

    #[tokio::test]
    async fn test_evaluate_skips_empty_steps_and_bad_replies() {
        let generator = Arc::new(ScriptedGenerator::new(["no json here"]));
        let evaluator = MemoryEvaluator::new(generator.clone(), PromptTemplates::default(), 4);

        let mut empty = step();
        empty.results.clear();
        assert!(evaluator.evaluate_memories(&empty, &conversation()).await.is_none());
        assert_eq!(generator.calls(), 0);

        assert!(evaluator.evaluate_memories(&step(), &conversation()).await.is_none());
        assert_eq!(generator.calls(), 1);
    }
}
