use std::{collections::HashMap, sync::Arc};

use common::{document::Chunk, error::AppError, utils::embedding::EmbeddingProvider};
use tracing::{instrument, warn};

use crate::{
    dense::DenseIndex,
    lexical::Bm25Index,
    reranking::RerankerPool,
    scoring::{fuse_scores, merge_scored_by_id, min_max_normalize, sort_by_fused_desc},
    scoring::{FusionWeights, ScoredChunk},
};

/// Tunables applied per retriever.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalTuning {
    pub top_k: usize,
    pub rerank_top_n: usize,
    pub weights: FusionWeights,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            top_k: 8,
            rerank_top_n: 4,
            weights: FusionWeights::default(),
        }
    }
}

/// Per-document retriever combining dense and lexical search with weighted
/// score fusion and an optional rerank stage.
pub struct HybridRetriever {
    chunks: Arc<Vec<Chunk>>,
    dense: DenseIndex,
    lexical: Bm25Index,
    embedder: Arc<EmbeddingProvider>,
    reranker: Option<Arc<RerankerPool>>,
    tuning: RetrievalTuning,
}

impl HybridRetriever {
    pub fn new(
        chunks: Arc<Vec<Chunk>>,
        embeddings: Vec<Vec<f32>>,
        embedder: Arc<EmbeddingProvider>,
        reranker: Option<Arc<RerankerPool>>,
        tuning: RetrievalTuning,
    ) -> Self {
        let contents: Vec<&str> = chunks.iter().map(|chunk| chunk.content.as_str()).collect();
        let lexical = Bm25Index::build(&contents);
        Self {
            chunks,
            dense: DenseIndex::new(embeddings),
            lexical,
            embedder,
            reranker,
            tuning,
        }
    }

    pub fn chunks(&self) -> Arc<Vec<Chunk>> {
        Arc::clone(&self.chunks)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Runs both retrieval legs and fuses their scores. A configured
    /// reranker refines the fused candidates; if it fails the fused order
    /// is returned as-is.
    #[instrument(skip_all)]
    pub async fn retrieve(&self, query: &str) -> Result<Vec<ScoredChunk>, AppError> {
        let query_embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| AppError::Embedding(e.to_string()))?;

        let dense_hits = self.dense.search(&query_embedding, self.tuning.top_k);
        let lexical_hits = self.lexical.search(query, self.tuning.top_k);

        let mut merged: HashMap<String, ScoredChunk> = HashMap::new();
        merge_scored_by_id(&mut merged, self.normalized_leg(&dense_hits, true));
        merge_scored_by_id(&mut merged, self.normalized_leg(&lexical_hits, false));

        let mut candidates: Vec<ScoredChunk> = merged.into_values().collect();
        for candidate in &mut candidates {
            candidate.fused = fuse_scores(&candidate.scores, self.tuning.weights);
        }
        sort_by_fused_desc(&mut candidates);
        candidates.truncate(self.tuning.top_k);

        if let Some(pool) = &self.reranker {
            match self.rerank_candidates(pool, query, &candidates).await {
                Ok(reranked) => return Ok(reranked),
                Err(e) => {
                    warn!("Reranking failed, falling back to fused order: {e}");
                }
            }
        }

        Ok(candidates)
    }

    fn normalized_leg(&self, hits: &[(usize, f32)], is_vector: bool) -> Vec<ScoredChunk> {
        let raw: Vec<f32> = hits.iter().map(|(_, score)| *score).collect();
        let normalized = min_max_normalize(&raw);

        hits.iter()
            .zip(normalized)
            .filter_map(|((index, _), score)| {
                let chunk = self.chunks.get(*index)?.clone();
                let scored = if is_vector {
                    ScoredChunk::new(chunk).with_vector_score(score)
                } else {
                    ScoredChunk::new(chunk).with_lexical_score(score)
                };
                Some(scored)
            })
            .collect()
    }

    async fn rerank_candidates(
        &self,
        pool: &Arc<RerankerPool>,
        query: &str,
        candidates: &[ScoredChunk],
    ) -> Result<Vec<ScoredChunk>, AppError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let lease = pool.checkout().await?;
        let documents: Vec<String> = candidates
            .iter()
            .map(|candidate| candidate.chunk.content.clone())
            .collect();
        let results = lease.rerank(query, documents).await?;

        let mut reranked: Vec<ScoredChunk> = results
            .into_iter()
            .filter_map(|result| {
                let candidate = candidates.get(result.index)?;
                let mut scored = candidate.clone();
                scored.fused = result.score;
                Some(scored)
            })
            .collect();
        sort_by_fused_desc(&mut reranked);
        reranked.truncate(self.tuning.rerank_top_n);
        Ok(reranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_chunks() -> Vec<Chunk> {
        vec![
            Chunk::new(
                "The mill produced flour for the whole valley".to_string(),
                "mill.txt".to_string(),
                0,
            ),
            Chunk::new(
                "Fishing boats left the harbor before dawn".to_string(),
                "mill.txt".to_string(),
                1,
            ),
            Chunk::new(
                "The flour was sold at the spring market".to_string(),
                "mill.txt".to_string(),
                2,
            ),
        ]
    }

    async fn build_retriever(tuning: RetrievalTuning) -> HybridRetriever {
        let embedder =
            Arc::new(EmbeddingProvider::new_hashed(64).expect("Failed to create provider"));
        let chunks = fixture_chunks();
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = embedder.embed_batch(texts).await.expect("embed batch");
        HybridRetriever::new(Arc::new(chunks), embeddings, embedder, None, tuning)
    }

    #[tokio::test]
    async fn test_retrieve_prefers_matching_chunks() {
        let retriever = build_retriever(RetrievalTuning::default()).await;
        let results = retriever.retrieve("flour mill").await.expect("retrieve");

        assert!(!results.is_empty());
        let top = &results[0];
        assert!(
            top.chunk.content.contains("flour"),
            "Expected a flour chunk first, got: {}",
            top.chunk.content
        );
    }

    #[tokio::test]
    async fn test_retrieve_respects_top_k() {
        let tuning = RetrievalTuning {
            top_k: 1,
            ..RetrievalTuning::default()
        };
        let retriever = build_retriever(tuning).await;
        let results = retriever.retrieve("flour market").await.expect("retrieve");
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_results_are_sorted_descending() {
        let retriever = build_retriever(RetrievalTuning::default()).await;
        let results = retriever
            .retrieve("harbor boats flour")
            .await
            .expect("retrieve");
        for pair in results.windows(2) {
            assert!(pair[0].fused >= pair[1].fused);
        }
    }
}
