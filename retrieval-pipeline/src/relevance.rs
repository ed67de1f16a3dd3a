use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::Arc,
};

use common::utils::llm::{ChatMessage, LlmClient};
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::scoring::ScoredChunk;

/// How many candidates are judged concurrently per round.
pub const RELEVANCE_BATCH_SIZE: usize = 50;

/// Content prefix length used for the cache key.
const CACHE_PREFIX_CHARS: usize = 200;

/// Content preview length handed to the judge model.
const PREVIEW_CHARS: usize = 500;

const JUDGE_SYSTEM_PROMPT: &str = "You judge whether a document excerpt is useful for answering a question. \
Reply with exactly one character: Y if the excerpt helps answer the question, N if it does not.";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelevanceStats {
    pub total: usize,
    pub relevant: usize,
    pub irrelevant: usize,
    pub cached: usize,
}

/// LLM-based yes/no filter over retrieved candidates.
///
/// Verdicts are cached for the lifetime of the process, keyed by the
/// question and a prefix of the chunk content, so re-asking a question
/// skips repeated judge calls.
pub struct RelevanceFilter {
    llm: Arc<LlmClient>,
    cache: Mutex<HashMap<(u64, u64), bool>>,
}

impl RelevanceFilter {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self {
            llm,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn evaluate(
        &self,
        question: &str,
        candidates: Vec<ScoredChunk>,
    ) -> (Vec<ScoredChunk>, RelevanceStats) {
        self.evaluate_batched(question, candidates, RELEVANCE_BATCH_SIZE)
            .await
    }

    /// Judges candidates in sequential batches with concurrent calls within
    /// each batch. Judge failures count the candidate as relevant.
    pub async fn evaluate_batched(
        &self,
        question: &str,
        candidates: Vec<ScoredChunk>,
        batch_size: usize,
    ) -> (Vec<ScoredChunk>, RelevanceStats) {
        let mut stats = RelevanceStats {
            total: candidates.len(),
            ..RelevanceStats::default()
        };
        let mut kept = Vec::new();

        for batch in candidates.chunks(batch_size.max(1)) {
            let verdicts = join_all(
                batch
                    .iter()
                    .map(|candidate| self.judge(question, &candidate.chunk.content)),
            )
            .await;

            for (candidate, (relevant, was_cached)) in batch.iter().zip(verdicts) {
                if was_cached {
                    stats.cached += 1;
                }
                if relevant {
                    stats.relevant += 1;
                    kept.push(candidate.clone());
                } else {
                    stats.irrelevant += 1;
                }
            }
        }

        debug!(
            total = stats.total,
            relevant = stats.relevant,
            cached = stats.cached,
            "Relevance evaluation finished"
        );
        (kept, stats)
    }

    async fn judge(&self, question: &str, content: &str) -> (bool, bool) {
        let key = fingerprint(question, content);
        if let Some(verdict) = self.cache.lock().await.get(&key) {
            return (*verdict, true);
        }

        let preview: String = content.chars().take(PREVIEW_CHARS).collect();
        let messages = [
            ChatMessage::system(JUDGE_SYSTEM_PROMPT),
            ChatMessage::human(format!(
                "Question: {question}\n\nExcerpt:\n{preview}\n\nAnswer Y or N:"
            )),
        ];

        let verdict = match self.llm.complete(&messages).await {
            Ok(output) => parse_relevance(&output),
            Err(e) => {
                // When the judge is unavailable keep the candidate.
                warn!("Relevance judgement failed, keeping candidate: {e}");
                true
            }
        };

        self.cache.lock().await.insert(key, verdict);
        (verdict, false)
    }
}

/// Interprets a judge reply. Ambiguous output keeps the candidate.
pub fn parse_relevance(output: &str) -> bool {
    let lower = output.trim().to_ascii_lowercase();
    if lower.starts_with('y') {
        return true;
    }
    if lower.starts_with('n') {
        return false;
    }
    // "irrelevant" contains "relevant", check it first
    if lower.contains("irrelevant") {
        return false;
    }
    if lower.contains("relevant") {
        return true;
    }
    warn!("Unparseable relevance verdict {output:?}, keeping candidate");
    true
}

/// Number of candidates to keep when the filter rejects everything.
pub fn fallback_count(top_k: usize, fallback_ratio: f32) -> usize {
    let scaled = (top_k as f32 * fallback_ratio).round() as usize;
    scaled.max(1)
}

fn fingerprint(question: &str, content: &str) -> (u64, u64) {
    let mut question_hasher = DefaultHasher::new();
    question.hash(&mut question_hasher);

    let prefix: String = content.chars().take(CACHE_PREFIX_CHARS).collect();
    let mut content_hasher = DefaultHasher::new();
    prefix.hash(&mut content_hasher);

    (question_hasher.finish(), content_hasher.finish())
}
