use std::sync::Arc;

use async_stream::stream;
use common::utils::llm::{ChatMessage, LlmClient};
use futures::{Stream, StreamExt};
use knowledge_base::KnowledgeBase;
use retrieval_pipeline::{
    relevance::{fallback_count, RelevanceFilter},
    reranking::RerankerPool,
    scoring::{sort_by_fused_desc, ScoredChunk},
};
use tokio::sync::mpsc;
use tracing::warn;

use crate::events::{AnswerEvent, QuerySummary, SmartMetadata, SourceRef};

/// Bound on buffered answer events between the retrieval task and the
/// consumer, so a slow consumer applies backpressure instead of growing
/// a queue.
const EVENT_QUEUE_CAPACITY: usize = 64;

const SMART_SYSTEM_PROMPT: &str = "You are answering a question from document excerpts that passed a \
relevance check. Base your answer on the excerpts and cite the source \
documents you used. When the excerpts do not contain the answer, say so.";

#[derive(Debug, Clone, Copy)]
pub struct SmartQueryConfig {
    pub top_k: usize,
    pub fallback_ratio: f32,
}

/// Retrieves from every document and merges by reciprocal rank: per-document
/// scores are not comparable across documents, rank position is. Failing
/// documents are skipped. Returns the global top-k plus the number of
/// documents searched.
pub(crate) async fn gather_ranked(
    kb: &KnowledgeBase,
    question: &str,
    top_k: usize,
) -> (Vec<ScoredChunk>, usize) {
    let names = kb.list();
    let documents_searched = names.len();

    let mut candidates: Vec<ScoredChunk> = Vec::new();
    for name in &names {
        let Some(retriever) = kb.get_retriever(name).await else {
            warn!("No retriever for {name}, skipping it for this query");
            continue;
        };
        match retriever.retrieve(question).await {
            Ok(results) => {
                for (rank, mut scored) in results.into_iter().enumerate() {
                    scored.fused = 1.0 / (rank as f32 + 1.0);
                    candidates.push(scored);
                }
            }
            Err(e) => warn!("Retrieval failed for {name}, skipping: {e}"),
        }
    }

    sort_by_fused_desc(&mut candidates);
    candidates.truncate(top_k);
    (candidates, documents_searched)
}

/// Gathers candidates across the corpus, filters them for relevance and
/// applies the fallback rule. Never errors.
async fn smart_retrieve(
    kb: &KnowledgeBase,
    filter: &RelevanceFilter,
    reranker: Option<&Arc<RerankerPool>>,
    question: &str,
    config: SmartQueryConfig,
) -> (Vec<ScoredChunk>, SmartMetadata) {
    let (candidates, documents_searched) = gather_ranked(kb, question, config.top_k).await;

    let (kept, stats) = filter.evaluate(question, candidates.clone()).await;

    let mut fallback_used = false;
    let selected = if kept.is_empty() && !candidates.is_empty() {
        fallback_used = true;
        let keep = fallback_count(config.top_k, config.fallback_ratio);
        let mut ordered = candidates;
        if let Some(pool) = reranker {
            match rerank_all(pool, question, &ordered).await {
                Ok(reranked) => ordered = reranked,
                Err(e) => warn!("Fallback rerank failed, keeping rank order: {e}"),
            }
        }
        ordered.truncate(keep);
        ordered
    } else {
        kept
    };

    let metadata = SmartMetadata {
        total_chunks: stats.total,
        relevant_chunks: stats.relevant,
        irrelevant_chunks: stats.irrelevant,
        fallback_used,
        documents_searched,
    };
    (selected, metadata)
}

async fn rerank_all(
    pool: &Arc<RerankerPool>,
    question: &str,
    candidates: &[ScoredChunk],
) -> Result<Vec<ScoredChunk>, common::error::AppError> {
    let lease = pool.checkout().await?;
    let documents: Vec<String> = candidates
        .iter()
        .map(|scored| scored.chunk.content.clone())
        .collect();
    let results = lease.rerank(question, documents).await?;

    let mut reranked: Vec<ScoredChunk> = results
        .into_iter()
        .filter_map(|result| {
            let mut scored = candidates.get(result.index)?.clone();
            scored.fused = result.score;
            Some(scored)
        })
        .collect();
    sort_by_fused_desc(&mut reranked);
    Ok(reranked)
}

fn smart_context(selected: &[ScoredChunk]) -> String {
    selected
        .iter()
        .enumerate()
        .map(|(i, scored)| {
            format!(
                "[{}] ({}) {}",
                i + 1,
                scored.chunk.metadata.source_document,
                scored.chunk.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Smart corpus query: retrieval and filtering run on their own task and
/// events flow through a bounded channel, so the caller's loop only ever
/// awaits the next event.
pub fn smart_answer_stream(
    llm: Arc<LlmClient>,
    kb: Arc<KnowledgeBase>,
    relevance: Arc<RelevanceFilter>,
    reranker: Option<Arc<RerankerPool>>,
    question: String,
    config: SmartQueryConfig,
) -> impl Stream<Item = AnswerEvent> + Send {
    let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    tokio::spawn(async move {
        let _ = tx
            .send(AnswerEvent::Status("Searching documents...".to_string()))
            .await;

        let (selected, metadata) =
            smart_retrieve(&kb, &relevance, reranker.as_ref(), &question, config).await;

        if selected.is_empty() {
            let _ = tx
                .send(AnswerEvent::Error(
                    "No relevant content found in the knowledge base".to_string(),
                ))
                .await;
            let _ = tx.send(AnswerEvent::Done).await;
            return;
        }

        if metadata.fallback_used {
            let _ = tx
                .send(AnswerEvent::Status(
                    "Relevance filter kept nothing; answering from the top-ranked excerpts"
                        .to_string(),
                ))
                .await;
        }

        let user_message = format!(
            "Context excerpts:\n==================\n{}\n\nQuestion:\n==================\n{question}",
            smart_context(&selected)
        );
        let messages = [
            ChatMessage::system(SMART_SYSTEM_PROMPT),
            ChatMessage::human(user_message),
        ];

        match llm.complete_stream(&messages).await {
            Ok(mut tokens) => {
                while let Some(token) = tokens.next().await {
                    match token {
                        Ok(token) => {
                            if tx.send(AnswerEvent::Token(token)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(AnswerEvent::Error(e.to_string())).await;
                            let _ = tx.send(AnswerEvent::Done).await;
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(AnswerEvent::Error(e.to_string())).await;
                let _ = tx.send(AnswerEvent::Done).await;
                return;
            }
        }

        let sources: Vec<SourceRef> = selected
            .iter()
            .enumerate()
            .map(|(i, scored)| SourceRef::from_chunk(i + 1, &scored.chunk, None))
            .collect();
        let mut summary = QuerySummary::new(sources, None);
        summary.metadata = Some(metadata);
        let _ = tx.send(AnswerEvent::Summary(summary)).await;
        let _ = tx.send(AnswerEvent::Done).await;
    });

    stream! {
        while let Some(event) = rx.recv().await {
            let done = matches!(event, AnswerEvent::Done);
            yield event;
            if done {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        parser::TextDocumentParser,
        utils::embedding::EmbeddingProvider,
    };
    use knowledge_base::KnowledgeBase;
    use retrieval_pipeline::RetrievalTuning;
    use std::{io::Write, path::Path};

    async fn seeded_kb(data_dir: &Path) -> Arc<KnowledgeBase> {
        let parser = Arc::new(TextDocumentParser::new(100, 20));
        let embedder =
            Arc::new(EmbeddingProvider::new_hashed(32).expect("Failed to create provider"));
        let kb = Arc::new(
            KnowledgeBase::open(data_dir, parser, embedder, None, RetrievalTuning::default())
                .expect("Failed to open knowledge base"),
        );

        for (name, content) in [
            ("mill.txt", "the mill ground flour for the valley ".repeat(20)),
            ("harbor.txt", "boats left the harbor before dawn ".repeat(20)),
        ] {
            let path = data_dir.join(name);
            let mut file = std::fs::File::create(&path).expect("Failed to create document");
            file.write_all(content.as_bytes())
                .expect("Failed to write document");
            kb.ingest(&path, None).await.expect("ingest");
        }
        kb
    }

    #[tokio::test]
    async fn test_fallback_keeps_bounded_selection() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let kb = seeded_kb(dir.path()).await;
        // Judge rejects everything, forcing the fallback path
        let filter = RelevanceFilter::new(Arc::new(LlmClient::new_canned("N")));

        let config = SmartQueryConfig {
            top_k: 4,
            fallback_ratio: 0.5,
        };
        let (selected, metadata) =
            smart_retrieve(&kb, &filter, None, "flour mill valley", config).await;

        assert!(metadata.fallback_used);
        assert_eq!(metadata.relevant_chunks, 0);
        assert_eq!(selected.len(), fallback_count(config.top_k, config.fallback_ratio));
        assert_eq!(metadata.documents_searched, 2);
    }

    #[tokio::test]
    async fn test_relevant_chunks_skip_fallback() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let kb = seeded_kb(dir.path()).await;
        let filter = RelevanceFilter::new(Arc::new(LlmClient::new_canned("Y")));

        let config = SmartQueryConfig {
            top_k: 4,
            fallback_ratio: 0.5,
        };
        let (selected, metadata) =
            smart_retrieve(&kb, &filter, None, "flour mill valley", config).await;

        assert!(!metadata.fallback_used);
        assert!(!selected.is_empty());
        assert_eq!(metadata.relevant_chunks, metadata.total_chunks);
    }

    #[tokio::test]
    async fn test_stream_ends_with_summary_and_done() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let kb = seeded_kb(dir.path()).await;
        let llm = Arc::new(LlmClient::new_canned("Y"));
        let relevance = Arc::new(RelevanceFilter::new(Arc::clone(&llm)));

        let events: Vec<AnswerEvent> = smart_answer_stream(
            llm,
            kb,
            relevance,
            None,
            "flour mill valley".to_string(),
            SmartQueryConfig {
                top_k: 4,
                fallback_ratio: 0.5,
            },
        )
        .collect()
        .await;

        assert!(matches!(events.last(), Some(AnswerEvent::Done)));
        assert!(events
            .iter()
            .any(|event| matches!(event, AnswerEvent::Token(_))));
        let summary = events.iter().find_map(|event| match event {
            AnswerEvent::Summary(summary) => Some(summary),
            _ => None,
        });
        let summary = summary.expect("Expected a summary event");
        let metadata = summary.metadata.expect("Expected smart metadata");
        assert!(!metadata.fallback_used);
        assert_eq!(summary.num_sources, summary.sources.len());
    }

    #[tokio::test]
    async fn test_empty_knowledge_base_reports_error_in_band() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let parser = Arc::new(TextDocumentParser::new(100, 20));
        let embedder =
            Arc::new(EmbeddingProvider::new_hashed(32).expect("Failed to create provider"));
        let kb = Arc::new(
            KnowledgeBase::open(
                dir.path(),
                parser,
                embedder,
                None,
                RetrievalTuning::default(),
            )
            .expect("Failed to open knowledge base"),
        );
        let llm = Arc::new(LlmClient::new_canned("Y"));
        let relevance = Arc::new(RelevanceFilter::new(Arc::clone(&llm)));

        let events: Vec<AnswerEvent> = smart_answer_stream(
            llm,
            kb,
            relevance,
            None,
            "anything".to_string(),
            SmartQueryConfig {
                top_k: 4,
                fallback_ratio: 0.5,
            },
        )
        .collect()
        .await;

        assert!(matches!(events.last(), Some(AnswerEvent::Done)));
        assert!(events
            .iter()
            .any(|event| matches!(event, AnswerEvent::Error(_))));
    }
}
