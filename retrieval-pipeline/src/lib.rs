pub mod dense;
pub mod hybrid;
pub mod lexical;
pub mod relevance;
pub mod reranking;
pub mod scoring;

pub use hybrid::{HybridRetriever, RetrievalTuning};
pub use relevance::{fallback_count, RelevanceFilter, RelevanceStats};
pub use reranking::RerankerPool;
pub use scoring::{FusionWeights, ScoredChunk};
