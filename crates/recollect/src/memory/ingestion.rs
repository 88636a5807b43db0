//! Memory ingestion
//!
//! Orchestrates the ingestion flow: content filtering, entity extraction,
//! embedding generation and storage.

use std::sync::Arc;
use tracing::debug;

use crate::embedding::Embedder;
use crate::error::Result;
use crate::memory::types::{Memory, count_entity_mentions};
use crate::ner::{EntityExtractor, extract_entity_names};
use crate::storage::GraphMemoryStore;

/// Minimum content length for ingestion (in characters)
pub const MIN_CONTENT_LENGTH: usize = 10;

/// Default confidence an extracted entity needs to be kept
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;

/// Completes a [`Memory`] before it is stored.
///
/// Entities are extracted only when the memory has none, and the embedding is
/// computed only when missing, so callers can supply either themselves.
#[derive(Clone)]
pub struct MemoryBuilder {
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn EntityExtractor>,
    min_confidence: f32,
}

impl MemoryBuilder {
    pub fn new(embedder: Arc<dyn Embedder>, extractor: Arc<dyn EntityExtractor>) -> Self {
        Self {
            embedder,
            extractor,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn build(&self, mut memory: Memory) -> Result<Memory> {
        if memory.entities.is_empty() {
            let names =
                extract_entity_names(self.extractor.as_ref(), &memory.memory, self.min_confidence)?;
            memory.entities = count_entity_mentions(&memory.memory, &names);
        }
        if memory.embedding.is_empty() {
            memory.embedding = self.embedder.embed(&memory.memory)?;
        }
        Ok(memory)
    }
}

/// Filters, completes and stores memories
pub struct IngestionPipeline {
    store: Arc<dyn GraphMemoryStore>,
    builder: MemoryBuilder,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn GraphMemoryStore>, builder: MemoryBuilder) -> Self {
        Self { store, builder }
    }

    /// Trim the text and drop memories too short to be useful
    fn prepare(&self, mut memory: Memory) -> Result<Option<Memory>> {
        let text = memory.memory.trim();
        if text.chars().count() < MIN_CONTENT_LENGTH {
            debug!("Skipping memory {}: content too short", memory.id);
            return Ok(None);
        }
        memory.memory = text.to_string();
        self.builder.build(memory).map(Some)
    }

    fn prepare_all(&self, memories: Vec<Memory>) -> Result<Vec<Memory>> {
        let mut prepared = Vec::with_capacity(memories.len());
        for memory in memories {
            prepared.extend(self.prepare(memory)?);
        }
        Ok(prepared)
    }

    /// Ingest one memory.
    ///
    /// Returns `Ok(None)` if the content was filtered out (empty or too
    /// short).
    pub async fn ingest(&self, memory: Memory) -> Result<Option<Memory>> {
        let Some(memory) = self.prepare(memory)? else {
            return Ok(None);
        };
        self.store.add_memory(&memory).await?;
        Ok(Some(memory))
    }

    /// Ingest plain text with default metadata
    pub async fn ingest_text(&self, text: &str) -> Result<Option<Memory>> {
        self.ingest(Memory::new(text)).await
    }

    /// Ingest independent memories in one store call
    pub async fn ingest_batch(&self, memories: Vec<Memory>) -> Result<Vec<Memory>> {
        let memories = self.prepare_all(memories)?;
        self.store.add_memory_batch(&memories).await?;
        Ok(memories)
    }

    /// Ingest consecutive passages, linking each to the next.
    ///
    /// Filtered passages are left out of the chain.
    pub async fn ingest_series(&self, memories: Vec<Memory>) -> Result<Vec<Memory>> {
        let memories = self.prepare_all(memories)?;
        self.store.add_memory_series(&memories).await?;
        Ok(memories)
    }
}
