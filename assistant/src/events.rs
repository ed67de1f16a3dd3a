use common::document::Chunk;
use serde::Serialize;

use crate::router::TaskType;

/// One item in the answer stream. Every stream terminates with `Done`,
/// including error paths; errors are delivered in-band.
#[derive(Debug, Clone, Serialize)]
pub enum AnswerEvent {
    /// Progress note emitted before tokens start (smart mode).
    Status(String),
    Token(String),
    Summary(QuerySummary),
    Error(String),
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuerySummary {
    pub sources: Vec<SourceRef>,
    pub num_sources: usize,
    pub task_type: Option<TaskType>,
    pub metadata: Option<SmartMetadata>,
}

impl QuerySummary {
    pub fn new(sources: Vec<SourceRef>, task_type: Option<TaskType>) -> Self {
        Self {
            num_sources: sources.len(),
            sources,
            task_type,
            metadata: None,
        }
    }
}

/// Retrieval statistics attached to smart-mode answers.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SmartMetadata {
    pub total_chunks: usize,
    pub relevant_chunks: usize,
    pub irrelevant_chunks: usize,
    pub fallback_used: bool,
    pub documents_searched: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    /// 1-based position in the answer's source listing.
    pub index: usize,
    pub document: String,
    pub page: Option<u32>,
    pub year: Option<String>,
    pub excerpt: String,
}

const EXCERPT_CHARS: usize = 200;

impl SourceRef {
    pub fn from_chunk(index: usize, chunk: &Chunk, year: Option<String>) -> Self {
        Self {
            index,
            document: chunk.metadata.source_document.clone(),
            page: chunk.metadata.page,
            year,
            excerpt: chunk.content.chars().take(EXCERPT_CHARS).collect(),
        }
    }
}
