//! Prompt templates for query generation and memory evaluation
//!
//! Every template can be overridden from the `[prompts]` config section.
//! `{max_queries}` in the query instructions is replaced at render time.

use crate::config::PromptsConfig;

pub const QUERY_INSTRUCTIONS: &str = r#"You are a query generator. Your job is to write search queries that retrieve memories from a long-term memory database, so the assistant can answer the user's latest message.
Take into account:
- What the user wants and the current conversation.
- Entities mentioned so far in the conversation.
- Context retrieved in earlier rounds, shown as assistant messages starting with "Retrieved Context:".
Write each query as a clear, specific question. Look for information not already covered by earlier queries, retrieved context or assistant replies.
Do not use relative time expressions such as "yesterday" or "last week" inside the query text; put time information in the time fields instead.
Name places, people, events, organisations and other entities as precisely as possible instead of using pronouns or generic terms.
Write at most {max_queries} queries, each covering a different aspect of the request.
Leave the query list empty when no more information is needed, either because it was already retrieved or because the message is simple enough to answer directly.
If the message is unclear or ambiguous, set "clarification_needed" to true and leave the query list empty.
Think inside <think></think> tags first, then reply with the JSON object only."#;

pub const QUERY_FORMAT: &str = r#"Reply with a JSON object of this shape:
{
  "clarification_needed": bool, # true when the user has to clarify the request first
  "queries": [
    {
      "query": str, # a verbose question used for semantic search
      "topic": str or null, # topic or entity the query focuses on
      "entities": [str, ...], # named entities: people, places, concepts, organisations, technologies
      "time_relevance": str, # one of UNKNOWN, DAY, WEEK, MONTH, YEAR, DECADE, CENTURY, ALWAYS
      "time_point": str or null # #d (days ago), #w (weeks ago), #m (months ago), #y (years ago), YYYY-MM-DD, YYYY-MM, YYYY, DD (day of this month), a month name (this year), a weekday name (this week) or UNKNOWN
    }
  ]
}
The JSON must be valid."#;

pub const QUERY_EXAMPLE: &str = r##"Example:
User message: "What did we decide about the project last week, and is the budget still on track?"
Conversation: earlier messages about the MiniEEG headset project and its funding.
Reply:
{
  "clarification_needed": false,
  "queries": [
    {
      "query": "Which decisions were made about the MiniEEG EEG headset project in last week's meeting?",
      "topic": "MiniEEG project decisions",
      "entities": ["MiniEEG", "EEG"],
      "time_relevance": "WEEK",
      "time_point": "#1w"
    },
    {
      "query": "What is the current state of the MiniEEG project budget?",
      "topic": "MiniEEG project budget",
      "entities": ["MiniEEG"],
      "time_relevance": "MONTH",
      "time_point": "#1m"
    }
  ]
}"##;

pub const QUERY_REPLY_BEGINNING: &str = "Okay, first I should think if the user's prompt has enough context to generate relevant queries, and if so, I will generate them in JSON format as specified.";

pub const EVALUATION_INSTRUCTIONS: &str = r#"You evaluate memories retrieved from a long-term memory database.
You receive the recent conversation between a user and an assistant, the queries used for retrieval and the numbered memories that were found.
Rate every memory by how well it answers the queries and how useful it is for replying to the user. Consider:
- Direct relevance to the queries
- Usefulness for writing the reply
- Whether the memory content is coherent
Think inside <think></think> tags first, then reply with the JSON object only, following the format exactly."#;

pub const EVALUATION_FORMAT: &str = r#"Reply with a JSON object of this shape:
<think>
What information is needed, and how each memory relates to it.
</think>
{
  "evaluations_list": [ # one entry per memory
    {
      "memory_id_int": <int>, # id of the memory from the provided list
      "short_feedback_str": "<string>", # one sentence explaining the rating
      "memory_keywords_list": ["<string>", ...], # keywords or entities shared by the memory and the queries, new ones allowed
      "relevance_str": "NONSENSE" | "IRRELEVANT" | "SUPPORTING" | "RELEVANT" | "PERFECT" # NONSENSE: does not make sense; IRRELEVANT: unrelated; SUPPORTING: not the answer but useful background; RELEVANT: related and useful; PERFECT: directly answers the query
    }
  ],
  "summary_str": "<string>", # coherent summary of the information in the SUPPORTING, RELEVANT and PERFECT memories
  "missing_keywords_list": ["<string>", ...], # important keywords that no memory covered
  "fully_answered_bool": <bool> # true when the memories fully answer the user's message
}"#;

pub const EVALUATION_EXAMPLE: &str = r#"Example reply, for a conversation about zero-knowledge proofs:
{
  "evaluations_list": [
    {
      "memory_id_int": 1,
      "short_feedback_str": "Gives a worked example of a zero-knowledge proof.",
      "memory_keywords_list": ["zero-knowledge proof", "cryptography"],
      "relevance_str": "PERFECT"
    },
    {
      "memory_id_int": 2,
      "short_feedback_str": "About RSA encryption, only loosely related to the question.",
      "memory_keywords_list": ["cryptography", "RSA"],
      "relevance_str": "IRRELEVANT"
    },
    {
      "memory_id_int": 3,
      "short_feedback_str": "A conspiracy theory about cats, unrelated and incoherent.",
      "memory_keywords_list": ["cats", "conspiracy"],
      "relevance_str": "NONSENSE"
    }
  ],
  "summary_str": "A zero-knowledge proof lets one party convince another that a statement is true without revealing anything beyond its truth...",
  "missing_keywords_list": [],
  "fully_answered_bool": true
}"#;

pub const EVALUATION_REPLY_BEGINNING: &str =
    "Okay, first I should examine what the conversation and the provided queries are about";

/// Resolved prompt templates
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplates {
    pub query_instructions: String,
    pub query_format: String,
    pub query_example: String,
    pub query_reply_beginning: String,
    pub evaluation_instructions: String,
    pub evaluation_format: String,
    pub evaluation_example: String,
    pub evaluation_reply_beginning: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self::from_config(&PromptsConfig::default())
    }
}

impl PromptTemplates {
    /// Defaults with any configured overrides applied
    pub fn from_config(config: &PromptsConfig) -> Self {
        let pick = |over: &Option<String>, default: &str| {
            over.clone().unwrap_or_else(|| default.to_string())
        };

        Self {
            query_instructions: pick(&config.query_instructions, QUERY_INSTRUCTIONS),
            query_format: pick(&config.query_format, QUERY_FORMAT),
            query_example: pick(&config.query_example, QUERY_EXAMPLE),
            query_reply_beginning: pick(&config.query_reply_beginning, QUERY_REPLY_BEGINNING),
            evaluation_instructions: pick(&config.evaluation_instructions, EVALUATION_INSTRUCTIONS),
            evaluation_format: pick(&config.evaluation_format, EVALUATION_FORMAT),
            evaluation_example: pick(&config.evaluation_example, EVALUATION_EXAMPLE),
            evaluation_reply_beginning: pick(
                &config.evaluation_reply_beginning,
                EVALUATION_REPLY_BEGINNING,
            ),
        }
    }

    /// System message for the query generator
    pub fn query_system_prompt(&self, max_queries: usize) -> String {
        let instructions = self
            .query_instructions
            .replace("{max_queries}", &max_queries.to_string());
        format!("{instructions}\n{}\n{}", self.query_format, self.query_example)
    }

    /// System message for the memory evaluator
    pub fn evaluation_system_prompt(&self) -> String {
        format!(
            "{}\n{}\n{}",
            self.evaluation_instructions, self.evaluation_format, self.evaluation_example
        )
    }

    /// Reply beginning for query generation, `None` when configured empty
    pub fn query_primer(&self) -> Option<&str> {
        Some(self.query_reply_beginning.as_str()).filter(|s| !s.is_empty())
    }

    /// Reply beginning for evaluation, `None` when configured empty
    pub fn evaluation_primer(&self) -> Option<&str> {
        Some(self.evaluation_reply_beginning.as_str()).filter(|s| !s.is_empty())
    }
}
