pub mod chunk_store;
pub mod hash_registry;
pub mod manager;
pub mod pending;
pub mod vector_store;

pub use chunk_store::ChunkStore;
pub use manager::{collection_id, DocumentInfo, KnowledgeBase};
pub use pending::{PendingDeletions, ReclaimSummary};
pub use vector_store::VectorStore;
