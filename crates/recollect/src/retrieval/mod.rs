//! Iterative, LLM-guided retrieval
//!
//! [`QueryGenerator`] writes queries, [`Retriever`] runs them against the
//! graph store, [`MemoryEvaluator`] keeps what is relevant and
//! [`RetrievalPipeline`] loops over the three until there is enough context.

pub mod evaluator;
pub mod generator;
pub mod pipeline;
pub mod query;
pub mod results;
pub mod retriever;

pub use evaluator::{Evaluation, MemoryEvaluator, MemoryRelevance, RatedMemory};
pub use generator::QueryGenerator;
pub use pipeline::{
    CancellationHandle, PipelineOutcome, PipelineStatus, PipelineUpdate, RetrievalPipeline,
};
pub use query::{
    EmbeddingQuery, EntityQuery, MemoryResult, Retrieval, RetrievalQuery, RetrievalStatus,
    RetrievalStep,
};
pub use retriever::Retriever;
