use std::{cmp::Ordering, collections::HashMap};

use common::document::Chunk;
use serde::{Deserialize, Serialize};

/// Holds optional subscores gathered from the two retrieval signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scores {
    pub vector: Option<f32>,
    pub lexical: Option<f32>,
}

/// A chunk combined with its accumulated retrieval scores.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub scores: Scores,
    pub fused: f32,
}

impl ScoredChunk {
    pub fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            scores: Scores::default(),
            fused: 0.0,
        }
    }

    pub const fn with_vector_score(mut self, score: f32) -> Self {
        self.scores.vector = Some(score);
        self
    }

    pub const fn with_lexical_score(mut self, score: f32) -> Self {
        self.scores.lexical = Some(score);
        self
    }
}

/// Weights used for linear score fusion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FusionWeights {
    pub vector: f32,
    pub lexical: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        // Equal weights: neither signal is trusted over the other by default
        Self {
            vector: 0.5,
            lexical: 0.5,
        }
    }
}

pub const fn clamp_unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }

    let mut min = f32::MAX;
    let mut max = f32::MIN;

    for s in scores {
        if !s.is_finite() {
            continue;
        }
        if *s < min {
            min = *s;
        }
        if *s > max {
            max = *s;
        }
    }

    if !min.is_finite() || !max.is_finite() {
        return scores.iter().map(|_| 0.0).collect();
    }

    if (max - min).abs() < f32::EPSILON {
        return vec![1.0; scores.len()];
    }

    scores
        .iter()
        .map(|score| {
            if score.is_finite() {
                clamp_unit((score - min) / (max - min))
            } else {
                0.0
            }
        })
        .collect()
}

pub fn fuse_scores(scores: &Scores, weights: FusionWeights) -> f32 {
    let vector = scores.vector.unwrap_or(0.0);
    let lexical = scores.lexical.unwrap_or(0.0);
    clamp_unit(vector.mul_add(weights.vector, lexical * weights.lexical))
}

/// Merges scored candidate lists, keeping the best subscore per chunk.
pub fn merge_scored_by_id(target: &mut HashMap<String, ScoredChunk>, incoming: Vec<ScoredChunk>) {
    for scored in incoming {
        let id = scored.chunk.source_id();
        target
            .entry(id)
            .and_modify(|existing| {
                if let Some(score) = scored.scores.vector {
                    let current = existing.scores.vector.unwrap_or(f32::MIN);
                    if score > current {
                        existing.scores.vector = Some(score);
                    }
                }
                if let Some(score) = scored.scores.lexical {
                    let current = existing.scores.lexical.unwrap_or(f32::MIN);
                    if score > current {
                        existing.scores.lexical = Some(score);
                    }
                }
            })
            .or_insert(scored);
    }
}

pub fn sort_by_fused_desc(items: &mut [ScoredChunk]) {
    items.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk.source_id().cmp(&b.chunk.source_id()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: &str, ordinal: usize) -> Chunk {
        Chunk::new(format!("content {ordinal}"), doc.to_string(), ordinal)
    }

    #[test]
    fn test_min_max_normalize_spreads_to_unit_range() {
        let normalized = min_max_normalize(&[2.0, 4.0, 6.0]);
        assert_eq!(normalized, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_min_max_normalize_constant_scores() {
        let normalized = min_max_normalize(&[3.0, 3.0]);
        assert_eq!(normalized, vec![1.0, 1.0]);
    }

    #[test]
    fn test_fuse_scores_equal_weights() {
        let scores = Scores {
            vector: Some(1.0),
            lexical: Some(0.0),
        };
        let fused = fuse_scores(&scores, FusionWeights::default());
        assert!((fused - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_merge_keeps_best_subscore() {
        let mut merged = HashMap::new();
        merge_scored_by_id(
            &mut merged,
            vec![ScoredChunk::new(chunk("a.txt", 0)).with_vector_score(0.4)],
        );
        merge_scored_by_id(
            &mut merged,
            vec![
                ScoredChunk::new(chunk("a.txt", 0)).with_lexical_score(0.9),
                ScoredChunk::new(chunk("b.txt", 0)).with_lexical_score(0.2),
            ],
        );

        assert_eq!(merged.len(), 2);
        let combined = merged.get("a.txt#0").expect("merged entry");
        assert_eq!(combined.scores.vector, Some(0.4));
        assert_eq!(combined.scores.lexical, Some(0.9));
    }

    #[test]
    fn test_sort_breaks_ties_by_id() {
        let mut items = vec![
            ScoredChunk::new(chunk("b.txt", 0)),
            ScoredChunk::new(chunk("a.txt", 0)),
        ];
        sort_by_fused_desc(&mut items);
        assert_eq!(items[0].chunk.metadata.source_document, "a.txt");
    }
}
