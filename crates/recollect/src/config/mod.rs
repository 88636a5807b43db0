use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use url::Url;

use crate::error::{RecollectError, Result};
use crate::retrieval::evaluator::MemoryRelevance;

/// Main configuration structure for recollect
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Graph store backend and location
    #[serde(default)]
    pub storage: StorageConfig,
    /// Embedding model configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Entity extraction configuration
    #[serde(default)]
    pub ner: NerConfig,
    /// Text generation backend
    #[serde(default)]
    pub generator: GeneratorConfig,
    /// Retrieval loop tuning
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Prompt template overrides
    #[serde(default)]
    pub prompts: PromptsConfig,
}

impl Config {
    /// Load from `path`, or from the first default location that exists.
    /// Falls back to defaults when no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let default_paths = [
            Some(PathBuf::from("recollect.toml")),
            dirs::config_dir().map(|c| c.join("recollect").join("config.toml")),
            dirs::home_dir().map(|h| h.join(".recollect").join("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                return Self::from_file(path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        info!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            RecollectError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| RecollectError::Config(format!("Failed to parse config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.storage.backend.as_str(), "lance" | "memory") {
            return Err(RecollectError::Config(format!(
                "Unknown storage backend: {}",
                self.storage.backend
            )));
        }
        if self.embedding.dimension != crate::embedding::EMBEDDING_DIMENSION {
            return Err(RecollectError::Config(format!(
                "Embedding dimension must be {}, got {}",
                crate::embedding::EMBEDDING_DIMENSION,
                self.embedding.dimension
            )));
        }
        if !matches!(self.ner.backend.as_str(), "bert" | "heuristic") {
            return Err(RecollectError::Config(format!(
                "Unknown NER backend: {}",
                self.ner.backend
            )));
        }
        Url::parse(&self.generator.api_url).map_err(|e| {
            RecollectError::Config(format!(
                "Invalid generator api_url {}: {e}",
                self.generator.api_url
            ))
        })?;
        if self.retrieval.max_iterations == 0 {
            return Err(RecollectError::Config(
                "retrieval.max_iterations must be at least 1".to_string(),
            ));
        }
        if MemoryRelevance::parse(&self.retrieval.relevance_threshold) == MemoryRelevance::Unknown {
            return Err(RecollectError::Config(format!(
                "Unknown relevance threshold: {}",
                self.retrieval.relevance_threshold
            )));
        }
        Ok(())
    }
}

/// Graph store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// `lance` (persistent) or `memory` (process-local)
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    /// Base directory for all storage data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Rows before an ANN index is built over embeddings
    #[serde(default = "default_vector_index_threshold")]
    pub vector_index_threshold: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            data_dir: default_data_dir(),
            vector_index_threshold: default_vector_index_threshold(),
        }
    }
}

fn default_storage_backend() -> String {
    "lance".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".recollect"))
        .unwrap_or_else(|| PathBuf::from(".recollect"))
}

fn default_vector_index_threshold() -> usize {
    256
}

/// Embedding model configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    /// Number of query embeddings kept in the LRU cache
    #[serde(default = "default_embedding_cache_size")]
    pub cache_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            cache_size: default_embedding_cache_size(),
        }
    }
}

fn default_embedding_model() -> String {
    "multilingual-e5-small".to_string()
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_embedding_cache_size() -> usize {
    512
}

/// Entity extraction configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NerConfig {
    /// `bert` (candle model) or `heuristic` (capitalised words)
    #[serde(default = "default_ner_backend")]
    pub backend: String,
    /// Hugging Face model id for the `bert` backend
    #[serde(default = "default_ner_model_id")]
    pub model_id: String,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

impl Default for NerConfig {
    fn default() -> Self {
        Self {
            backend: default_ner_backend(),
            model_id: default_ner_model_id(),
            min_confidence: default_min_confidence(),
        }
    }
}

fn default_ner_backend() -> String {
    "bert".to_string()
}

fn default_ner_model_id() -> String {
    crate::ner::DEFAULT_NER_MODEL.to_string()
}

fn default_min_confidence() -> f32 {
    0.5
}

/// OpenAI-compatible chat completions backend
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorConfig {
    /// Chat completions endpoint URL
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Environment variable name for API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_generator_model")]
    pub model: String,
    /// Request timeout in seconds
    #[serde(default = "default_generator_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default)]
    pub frequency_penalty: f32,
    #[serde(default)]
    pub presence_penalty: f32,
    #[serde(default)]
    pub stop: Vec<String>,
    /// Attempts for rate-limited requests and unparseable structured output
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key_env: default_api_key_env(),
            model: default_generator_model(),
            timeout_secs: default_generator_timeout_secs(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stop: Vec::new(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_api_key_env() -> String {
    "RECOLLECT_API_KEY".to_string()
}

fn default_generator_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_generator_timeout_secs() -> u64 {
    60
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_top_p() -> f32 {
    0.9
}

fn default_top_k() -> u32 {
    50
}

fn default_max_retries() -> u32 {
    3
}

/// Retrieval loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    /// Maximum query generation rounds per user turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Maximum queries kept from one generation round
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,
    /// Results kept per round
    #[serde(default = "default_top_k_results")]
    pub top_k: usize,
    /// Candidates fetched per query
    #[serde(default = "default_per_query_limit")]
    pub per_query_limit: usize,
    #[serde(default)]
    pub min_score: f32,
    /// Results guaranteed to every query before the global cap
    #[serde(default = "default_min_query_results")]
    pub min_query_results: usize,
    /// Lowest evaluator rating kept as context
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: String,
    /// Conversation messages shown to the evaluator
    #[serde(default = "default_evaluation_history")]
    pub evaluation_history: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_queries: default_max_queries(),
            top_k: default_top_k_results(),
            per_query_limit: default_per_query_limit(),
            min_score: 0.0,
            min_query_results: default_min_query_results(),
            relevance_threshold: default_relevance_threshold(),
            evaluation_history: default_evaluation_history(),
        }
    }
}

fn default_max_iterations() -> usize {
    3
}

fn default_max_queries() -> usize {
    5
}

fn default_top_k_results() -> usize {
    10
}

fn default_per_query_limit() -> usize {
    10
}

fn default_min_query_results() -> usize {
    1
}

fn default_relevance_threshold() -> String {
    "supporting".to_string()
}

fn default_evaluation_history() -> usize {
    10
}

/// Prompt template overrides; unset fields keep the built-in wording
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PromptsConfig {
    pub query_instructions: Option<String>,
    pub query_format: Option<String>,
    pub query_example: Option<String>,
    pub query_reply_beginning: Option<String>,
    pub evaluation_instructions: Option<String>,
    pub evaluation_format: Option<String>,
    pub evaluation_example: Option<String>,
    pub evaluation_reply_beginning: Option<String>,
}
