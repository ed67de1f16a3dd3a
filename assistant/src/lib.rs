pub mod conversation;
pub mod events;
pub mod router;
pub mod smart;

use std::{path::Path, pin::Pin, sync::Arc};

use async_openai::{config::OpenAIConfig, Client};
use async_stream::stream;
use common::{
    error::AppError,
    parser::TextDocumentParser,
    utils::{
        config::AppConfig,
        embedding::EmbeddingProvider,
        llm::{ChatSettings, LlmClient},
    },
};
use futures::{Stream, StreamExt};
use knowledge_base::{DocumentInfo, KnowledgeBase};
use retrieval_pipeline::{
    relevance::RelevanceFilter,
    reranking::RerankerPool,
    scoring::FusionWeights,
    RetrievalTuning,
};
use serde::Serialize;
use tracing::warn;

use crate::{
    conversation::{ConversationManager, GENERAL_SYSTEM_PROMPT, KB_SYSTEM_PROMPT},
    events::{AnswerEvent, QuerySummary, SourceRef},
    smart::SmartQueryConfig,
};

pub use crate::events::SmartMetadata;
pub use crate::router::TaskType;

/// Strategy for a corpus-wide question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorpusMode {
    /// Keyword routing over pooled chunks, no relevance filter.
    Fast,
    /// Per-document hybrid retrieval plus LLM relevance filtering.
    Smart,
}

#[derive(Debug, Clone)]
pub struct AnswerWithSources {
    pub answer: String,
    pub sources: Vec<SourceRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantStatus {
    pub model: String,
    pub available_models: Vec<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub embedding_backend: &'static str,
    pub document_count: usize,
    pub conversation_turns: usize,
    pub top_k: usize,
    pub rerank_enabled: bool,
}

/// Ties the knowledge base, the retrieval stack, the relevance filter and
/// the conversation together behind one interface. The conversation is
/// shared across all query styles; a turn counts regardless of how it was
/// answered.
pub struct DocumentAssistant {
    config: AppConfig,
    llm: Arc<LlmClient>,
    embedder: Arc<EmbeddingProvider>,
    kb: Arc<KnowledgeBase>,
    conversation: Arc<ConversationManager>,
    relevance: Arc<RelevanceFilter>,
    reranker: Option<Arc<RerankerPool>>,
}

impl DocumentAssistant {
    pub async fn new(config: AppConfig) -> Result<Self, AppError> {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.openai_api_key.clone())
            .with_api_base(config.openai_base_url.clone());
        let client = Arc::new(Client::with_config(openai_config));

        let embedder =
            Arc::new(EmbeddingProvider::from_config(&config, Some(Arc::clone(&client))).await?);
        let reranker = RerankerPool::maybe_from_config(&config)?;
        let llm = Arc::new(LlmClient::new_openai(
            client,
            ChatSettings {
                model: config.chat_model.clone(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            },
            config.available_models.clone(),
        ));

        Self::with_resources(config, llm, embedder, reranker)
    }

    /// Wires the assistant from pre-built resources. `new` funnels through
    /// this; tests use it with deterministic backends.
    pub fn with_resources(
        config: AppConfig,
        llm: Arc<LlmClient>,
        embedder: Arc<EmbeddingProvider>,
        reranker: Option<Arc<RerankerPool>>,
    ) -> Result<Self, AppError> {
        let tuning = RetrievalTuning {
            top_k: config.top_k,
            rerank_top_n: config.rerank_top_n,
            weights: FusionWeights {
                vector: config.vector_weight,
                lexical: config.lexical_weight,
            },
        };
        let parser = Arc::new(TextDocumentParser::new(
            config.chunk_size,
            config.chunk_overlap,
        ));
        let kb = Arc::new(KnowledgeBase::open(
            Path::new(&config.data_dir),
            parser,
            Arc::clone(&embedder),
            reranker.clone(),
            tuning,
        )?);
        let relevance = Arc::new(RelevanceFilter::new(Arc::clone(&llm)));

        Ok(Self {
            config,
            llm,
            embedder,
            kb,
            conversation: Arc::new(ConversationManager::new()),
            relevance,
            reranker,
        })
    }

    /// Re-indexes every stored document; returns how many loaded.
    pub async fn preload(&self) -> usize {
        self.kb.preload().await
    }

    pub async fn add_document(&self, source: &Path, name: Option<&str>) -> Option<String> {
        self.kb.ingest(source, name).await
    }

    pub async fn update_document(&self, source: &Path, force: bool) -> Option<String> {
        self.kb.update(source, force).await
    }

    pub fn delete_document(&self, name: &str) -> bool {
        self.kb.delete(name)
    }

    pub fn list_documents(&self) -> Vec<String> {
        self.kb.list()
    }

    pub fn document_info(&self, name: &str) -> Option<DocumentInfo> {
        self.kb.info(name)
    }

    /// Answers one question, optionally scoped to a single document, and
    /// records the completed turn.
    pub async fn ask(
        &self,
        question: &str,
        document: Option<&str>,
    ) -> Result<AnswerWithSources, AppError> {
        let (system_prompt, sources) =
            single_document_prompt(&self.kb, document, question).await;
        let messages = self.conversation.build_messages(&system_prompt, question);
        let answer = self.llm.complete(&messages).await?;
        self.conversation.record_turn(question, &answer);
        Ok(AnswerWithSources { answer, sources })
    }

    /// Streaming variant of [`ask`](Self::ask). The turn is recorded only
    /// once the stream finished without an error event.
    pub fn ask_stream(
        &self,
        question: String,
        document: Option<String>,
    ) -> impl Stream<Item = AnswerEvent> + Send {
        let llm = Arc::clone(&self.llm);
        let kb = Arc::clone(&self.kb);
        let conversation = Arc::clone(&self.conversation);

        stream! {
            let (system_prompt, sources) =
                single_document_prompt(&kb, document.as_deref(), &question).await;
            let messages = conversation.build_messages(&system_prompt, &question);

            let mut answer = String::new();
            match llm.complete_stream(&messages).await {
                Ok(mut tokens) => {
                    while let Some(token) = tokens.next().await {
                        match token {
                            Ok(token) => {
                                answer.push_str(&token);
                                yield AnswerEvent::Token(token);
                            }
                            Err(e) => {
                                yield AnswerEvent::Error(e.to_string());
                                yield AnswerEvent::Done;
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    yield AnswerEvent::Error(e.to_string());
                    yield AnswerEvent::Done;
                    return;
                }
            }

            conversation.record_turn(&question, &answer);
            yield AnswerEvent::Summary(QuerySummary::new(sources, None));
            yield AnswerEvent::Done;
        }
    }

    /// Corpus-wide question answered in one piece: the best-ranked chunks
    /// from every document go into a single completion.
    pub async fn ask_corpus(&self, question: &str) -> Result<AnswerWithSources, AppError> {
        let (hits, _) = smart::gather_ranked(&self.kb, question, self.config.top_k).await;
        if hits.is_empty() {
            return Err(AppError::NotFound(
                "no indexed documents to search".to_string(),
            ));
        }

        let (context, sources) = numbered_context(&hits);
        let system_prompt = KB_SYSTEM_PROMPT.replace("{context}", &context);
        let messages = self.conversation.build_messages(&system_prompt, question);
        let answer = self.llm.complete(&messages).await?;
        self.conversation.record_turn(question, &answer);
        Ok(AnswerWithSources { answer, sources })
    }

    /// Streams an answer over the whole corpus in the chosen mode and
    /// records the turn once the stream completed cleanly.
    pub fn ask_corpus_stream(
        &self,
        question: String,
        mode: CorpusMode,
    ) -> Pin<Box<dyn Stream<Item = AnswerEvent> + Send>> {
        let inner: Pin<Box<dyn Stream<Item = AnswerEvent> + Send>> = match mode {
            CorpusMode::Fast => Box::pin(router::corpus_answer_stream(
                Arc::clone(&self.llm),
                Arc::clone(&self.kb),
                question.clone(),
            )),
            CorpusMode::Smart => Box::pin(smart::smart_answer_stream(
                Arc::clone(&self.llm),
                Arc::clone(&self.kb),
                Arc::clone(&self.relevance),
                self.reranker.clone(),
                question.clone(),
                SmartQueryConfig {
                    top_k: self.config.top_k,
                    fallback_ratio: self.config.fallback_ratio,
                },
            )),
        };

        let conversation = Arc::clone(&self.conversation);
        Box::pin(stream! {
            let mut inner = inner;
            let mut answer = String::new();
            let mut failed = false;
            while let Some(event) = inner.next().await {
                match &event {
                    AnswerEvent::Token(token) => answer.push_str(token),
                    AnswerEvent::Error(_) => failed = true,
                    _ => {}
                }
                yield event;
            }
            if !failed && !answer.is_empty() {
                conversation.record_turn(&question, &answer);
            }
        })
    }

    pub fn clear_history(&self) {
        self.conversation.clear();
    }

    pub fn history(&self) -> Vec<common::utils::llm::ChatMessage> {
        self.conversation.history()
    }

    pub fn turn_count(&self) -> usize {
        self.conversation.turn_count()
    }

    pub fn switch_model(&self, model: &str) -> Result<(), AppError> {
        self.llm.switch_model(model)
    }

    pub fn update_parameters(&self, temperature: Option<f32>, max_tokens: Option<u32>) {
        self.llm.update_parameters(temperature, max_tokens);
    }

    pub fn status(&self) -> AssistantStatus {
        let settings = self.llm.settings();
        AssistantStatus {
            model: settings.model,
            available_models: self.llm.available_models().to_vec(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            embedding_backend: self.embedder.backend_label(),
            document_count: self.kb.list().len(),
            conversation_turns: self.conversation.turn_count(),
            top_k: self.config.top_k,
            rerank_enabled: self.reranker.is_some(),
        }
    }
}

/// Builds the system prompt and sources for a single-document question.
/// An unknown document or a failed retrieval degrades to the general
/// prompt so the question is still answered.
async fn single_document_prompt(
    kb: &KnowledgeBase,
    document: Option<&str>,
    question: &str,
) -> (String, Vec<SourceRef>) {
    let Some(name) = document else {
        return (GENERAL_SYSTEM_PROMPT.to_string(), Vec::new());
    };
    let Some(retriever) = kb.get_retriever(name).await else {
        warn!("Unknown document {name}, answering without document context");
        return (GENERAL_SYSTEM_PROMPT.to_string(), Vec::new());
    };

    match retriever.retrieve(question).await {
        Ok(hits) if !hits.is_empty() => {
            let (context, sources) = numbered_context(&hits);
            (KB_SYSTEM_PROMPT.replace("{context}", &context), sources)
        }
        Ok(_) => (
            KB_SYSTEM_PROMPT.replace("{context}", "(no matching excerpts)"),
            Vec::new(),
        ),
        Err(e) => {
            warn!("Retrieval failed for {name}, answering without context: {e}");
            (GENERAL_SYSTEM_PROMPT.to_string(), Vec::new())
        }
    }
}

/// Numbered source blocks (with page numbers when present) plus the
/// matching source list.
fn numbered_context(hits: &[retrieval_pipeline::ScoredChunk]) -> (String, Vec<SourceRef>) {
    let context = hits
        .iter()
        .enumerate()
        .map(|(i, scored)| {
            let page = scored
                .chunk
                .metadata
                .page
                .map(|p| format!(", page {p}"))
                .unwrap_or_default();
            format!(
                "[{}] ({}{page}) {}",
                i + 1,
                scored.chunk.metadata.source_document,
                scored.chunk.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    let sources = hits
        .iter()
        .enumerate()
        .map(|(i, scored)| SourceRef::from_chunk(i + 1, &scored.chunk, None))
        .collect();
    (context, sources)
}
