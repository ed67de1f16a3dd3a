use serde::{Deserialize, Serialize};

/// A contiguous span of a source document, the unit of indexing and retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// File name of the document this chunk was split from.
    pub source_document: String,
    /// Page number when the source format has pages.
    pub page: Option<u32>,
    /// Position of this chunk within the parse order of its document.
    pub ordinal: usize,
}

impl Chunk {
    pub fn new(content: String, source_document: String, ordinal: usize) -> Self {
        Self {
            content,
            metadata: ChunkMetadata {
                source_document,
                page: None,
                ordinal,
            },
        }
    }

    /// Stable identity of a chunk within the knowledge base.
    pub fn source_id(&self) -> String {
        format!(
            "{}#{}",
            self.metadata.source_document, self.metadata.ordinal
        )
    }
}
