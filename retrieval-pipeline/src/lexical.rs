use std::{cmp::Ordering, collections::HashMap};

const K1: f32 = 1.2;
const B: f32 = 0.75;

/// In-process Okapi BM25 index over a fixed set of texts.
///
/// Documents are addressed by their position in the slice the index was
/// built from, so callers can map hits back to chunks without copies.
pub struct Bm25Index {
    term_frequencies: Vec<HashMap<String, f32>>,
    document_lengths: Vec<f32>,
    document_frequencies: HashMap<String, f32>,
    average_length: f32,
}

impl Bm25Index {
    pub fn build<S: AsRef<str>>(texts: &[S]) -> Self {
        let mut term_frequencies = Vec::with_capacity(texts.len());
        let mut document_lengths = Vec::with_capacity(texts.len());
        let mut document_frequencies: HashMap<String, f32> = HashMap::new();

        for text in texts {
            let mut frequencies: HashMap<String, f32> = HashMap::new();
            let mut length = 0.0f32;
            for token in tokens(text.as_ref()) {
                length += 1.0;
                *frequencies.entry(token).or_insert(0.0) += 1.0;
            }
            for term in frequencies.keys() {
                *document_frequencies.entry(term.clone()).or_insert(0.0) += 1.0;
            }
            term_frequencies.push(frequencies);
            document_lengths.push(length);
        }

        let total: f32 = document_lengths.iter().sum();
        let average_length = if document_lengths.is_empty() {
            0.0
        } else {
            total / document_lengths.len() as f32
        };

        Self {
            term_frequencies,
            document_lengths,
            document_frequencies,
            average_length,
        }
    }

    pub fn len(&self) -> usize {
        self.term_frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.term_frequencies.is_empty()
    }

    /// Scores every document against the query and returns the top `k`
    /// (document index, score) pairs, best first. Zero-score documents are
    /// dropped.
    pub fn search(&self, query: &str, k: usize) -> Vec<(usize, f32)> {
        if self.is_empty() || k == 0 {
            return Vec::new();
        }

        let query_terms: Vec<String> = tokens(query).collect();
        if query_terms.is_empty() {
            return Vec::new();
        }

        let corpus_size = self.term_frequencies.len() as f32;
        let mut hits: Vec<(usize, f32)> = Vec::new();

        for (index, frequencies) in self.term_frequencies.iter().enumerate() {
            let length = self.document_lengths.get(index).copied().unwrap_or(0.0);
            let mut score = 0.0f32;

            for term in &query_terms {
                let Some(tf) = frequencies.get(term) else {
                    continue;
                };
                let df = self.document_frequencies.get(term).copied().unwrap_or(0.0);
                let idf = ((corpus_size - df + 0.5) / (df + 0.5) + 1.0).ln();
                let length_norm = if self.average_length > 0.0 {
                    1.0 - B + B * length / self.average_length
                } else {
                    1.0
                };
                score += idf * (tf * (K1 + 1.0)) / (tf + K1 * length_norm);
            }

            if score > 0.0 {
                hits.push((index, score));
            }
        }

        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        hits.truncate(k);
        hits
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranks_matching_document_first() {
        let index = Bm25Index::build(&[
            "the cat sat on the mat",
            "dogs chase cats in the yard",
            "a treatise on quantum mechanics",
        ]);

        let hits = index.search("quantum mechanics", 3);
        assert_eq!(hits.first().map(|h| h.0), Some(2));
    }

    #[test]
    fn test_rarer_terms_score_higher() {
        let index = Bm25Index::build(&[
            "common words appear here",
            "common words appear here too",
            "an unusual zephyr of common words",
        ]);

        let hits = index.search("zephyr", 3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 2);
    }

    #[test]
    fn test_no_match_yields_empty() {
        let index = Bm25Index::build(&["alpha beta", "gamma delta"]);
        assert!(index.search("omega", 5).is_empty());
        assert!(index.search("", 5).is_empty());
    }

    #[test]
    fn test_truncates_to_k() {
        let texts: Vec<String> = (0..10).map(|i| format!("shared token doc{i}")).collect();
        let index = Bm25Index::build(&texts);
        assert_eq!(index.search("shared", 3).len(), 3);
    }
}
