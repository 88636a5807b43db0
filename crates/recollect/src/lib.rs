//! Recollect - graph-backed long-term memory for conversational agents
//!
//! Memories are stored in a graph of memories, entities, sources and authors.
//! For every user turn an LLM writes retrieval queries, the store answers
//! them by entity and by embedding, and a second LLM pass keeps what is
//! relevant. The loop repeats until the question is covered, then the
//! collected context is handed to the response generator.

pub mod config;
pub mod conversation;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod memory;
pub mod ner;
pub mod retrieval;
pub mod storage;
pub mod testing;
pub mod util;

pub use error::RecollectError;
