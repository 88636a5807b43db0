//! Memory model and ingestion
//!
//! Defines the stored memory record, its provenance and temporal relevance,
//! and the pipeline that fills in entities and embeddings before storage.

pub mod ingestion;
pub mod relevance;
pub mod source;
pub mod types;

pub use ingestion::{IngestionPipeline, MIN_CONTENT_LENGTH, MemoryBuilder};
pub use relevance::TimeRelevance;
pub use source::{Source, SourceType};
pub use types::{FeedbackType, Memory, MemoryFeedback};
