use std::{fmt, sync::Arc};

use async_stream::stream;
use common::{
    document::Chunk,
    utils::llm::{ChatMessage, LlmClient},
};
use futures::{Stream, StreamExt};
use knowledge_base::KnowledgeBase;
use retrieval_pipeline::lexical::Bm25Index;
use serde::Serialize;
use tracing::warn;

use crate::events::{AnswerEvent, QuerySummary, SourceRef};

const STATISTICAL_TOP_K: usize = 20;
const EVOLUTION_TOP_K: usize = 15;
const GENERAL_TOP_K: usize = 15;
const GENERAL_CONTEXT_LIMIT: usize = 10;

/// Sort key for documents without a year in their file name; sorts after
/// every real year.
const YEAR_SENTINEL: &str = "9999";

/// Counting/frequency phrasing. Checked before the evolution rule, so a
/// question matching both is treated as statistical.
const STATISTICAL_KEYWORDS: &[&str] = &[
    "how many",
    "how often",
    "how much",
    "count",
    "number of",
    "total number",
    "frequency",
    "statistics",
    "mention",
    "enumerate",
    "list all",
];

/// Markers hinting at development over time. A marker alone is not enough;
/// see [`classify`].
const EVOLUTION_MARKERS: &[&str] = &[
    "evolution",
    "evolve",
    "develop",
    "change",
    "over time",
    "shift",
    "progress",
];

const STATISTICAL_SYSTEM_PROMPT: &str = "You are analyzing document excerpts to answer a counting question. \
Work through the excerpts document by document. Cite the source document \
for every mention you count, then finish with a single tally line of the \
form 'Total: N'. Do not skip or merge mentions.";

const EVOLUTION_SYSTEM_PROMPT: &str = "You are analyzing document excerpts ordered chronologically by year. \
Describe how the subject develops over time: summarize each period, then \
point out what changed between periods. Cite the source document and year \
for every claim.";

const GENERAL_SYSTEM_PROMPT: &str = "You are answering a question from ranked document excerpts. Base your \
answer on the excerpts and cite the source documents you used. When the \
excerpts do not contain the answer, say so.";

/// Closed set of corpus-query strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskType {
    Statistical,
    Evolution,
    General,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Statistical => write!(f, "statistical"),
            TaskType::Evolution => write!(f, "evolution"),
            TaskType::General => write!(f, "general"),
        }
    }
}

/// Keyword classifier over the lowercased question.
///
/// Statistical keywords win outright. Evolution needs a change marker plus
/// either a from/to pair or the word "change"; everything else is general.
/// The rule is intentionally simple and is kept as-is, false negatives
/// included, so routing stays predictable.
pub fn classify(question: &str) -> TaskType {
    let q = question.to_lowercase();

    if STATISTICAL_KEYWORDS.iter().any(|k| q.contains(k)) {
        return TaskType::Statistical;
    }

    let has_marker = EVOLUTION_MARKERS.iter().any(|k| q.contains(k));
    if has_marker && ((q.contains("from") && q.contains("to")) || q.contains("change")) {
        return TaskType::Evolution;
    }

    TaskType::General
}

/// First standalone 19xx/20xx token in the file name.
pub fn extract_year(file_name: &str) -> Option<&str> {
    let bytes = file_name.as_bytes();
    for start in 0..bytes.len().saturating_sub(3) {
        let Some(window) = bytes.get(start..start + 4) else {
            break;
        };
        if !window.iter().all(u8::is_ascii_digit) {
            continue;
        }
        if start > 0 && bytes.get(start - 1).is_some_and(u8::is_ascii_digit) {
            continue;
        }
        if bytes.get(start + 4).is_some_and(u8::is_ascii_digit) {
            continue;
        }
        if window.starts_with(b"19") || window.starts_with(b"20") {
            return file_name.get(start..start + 4);
        }
    }
    None
}

fn year_sort_key(file_name: &str) -> String {
    extract_year(file_name).unwrap_or(YEAR_SENTINEL).to_owned()
}

/// Union of the cached chunks of every listed document. Documents without
/// cached chunks are skipped with a warning; the query proceeds on the rest.
fn gather_corpus(kb: &KnowledgeBase) -> Vec<Chunk> {
    let mut corpus = Vec::new();
    for name in kb.list() {
        match kb.cached_chunks(&name) {
            Some(chunks) => corpus.extend(chunks.iter().cloned()),
            None => warn!("No cached chunks for {name}, skipping it for this query"),
        }
    }
    corpus
}

fn rank_corpus(question: &str, corpus: &[Chunk], k: usize) -> Vec<Chunk> {
    let texts: Vec<&str> = corpus.iter().map(|chunk| chunk.content.as_str()).collect();
    let index = Bm25Index::build(&texts);
    index
        .search(question, k)
        .into_iter()
        .filter_map(|(i, _)| corpus.get(i).cloned())
        .collect()
}

/// Lexical top hits regrouped by document so mentions can be counted per
/// source. Scores only decide membership, not presentation order.
fn statistical_selection(question: &str, corpus: &[Chunk]) -> Vec<Chunk> {
    let mut hits = rank_corpus(question, corpus, STATISTICAL_TOP_K);
    hits.sort_by(|a, b| {
        a.metadata
            .source_document
            .cmp(&b.metadata.source_document)
            .then(a.metadata.ordinal.cmp(&b.metadata.ordinal))
    });
    hits
}

fn statistical_context(hits: &[Chunk]) -> String {
    let mut context = String::new();
    let mut current_doc: Option<&str> = None;
    for chunk in hits {
        let doc = chunk.metadata.source_document.as_str();
        if current_doc != Some(doc) {
            context.push_str(&format!("\n=== {doc} ===\n"));
            current_doc = Some(doc);
        }
        context.push_str(&chunk.content);
        context.push('\n');
    }
    context
}

/// Lexical top hits annotated with the year from their file name, ordered
/// by (year, document, ordinal) regardless of retrieval score.
fn evolution_selection(question: &str, corpus: &[Chunk]) -> Vec<(String, Chunk)> {
    let mut hits: Vec<(String, Chunk)> = rank_corpus(question, corpus, EVOLUTION_TOP_K)
        .into_iter()
        .map(|chunk| (year_sort_key(&chunk.metadata.source_document), chunk))
        .collect();
    hits.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| {
                a.1.metadata
                    .source_document
                    .cmp(&b.1.metadata.source_document)
            })
            .then(a.1.metadata.ordinal.cmp(&b.1.metadata.ordinal))
    });
    hits
}

fn evolution_context(hits: &[(String, Chunk)]) -> String {
    let mut context = String::new();
    let mut current_year: Option<&str> = None;
    for (year, chunk) in hits {
        let label = if year == YEAR_SENTINEL {
            "undated"
        } else {
            year.as_str()
        };
        if current_year != Some(label) {
            context.push_str(&format!("\n--- {label} ---\n"));
            current_year = Some(label);
        }
        context.push_str(&format!(
            "[{}] {}\n",
            chunk.metadata.source_document, chunk.content
        ));
    }
    context
}

fn general_selection(question: &str, corpus: &[Chunk]) -> Vec<Chunk> {
    let mut hits = rank_corpus(question, corpus, GENERAL_TOP_K);
    hits.truncate(GENERAL_CONTEXT_LIMIT);
    hits
}

fn general_context(hits: &[Chunk]) -> String {
    hits.iter()
        .enumerate()
        .map(|(i, chunk)| {
            format!(
                "[{}] ({}) {}",
                i + 1,
                chunk.metadata.source_document,
                chunk.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn sources_from(hits: &[Chunk], with_year: bool) -> Vec<SourceRef> {
    hits.iter()
        .enumerate()
        .map(|(i, chunk)| {
            let year = if with_year {
                extract_year(&chunk.metadata.source_document).map(str::to_owned)
            } else {
                None
            };
            SourceRef::from_chunk(i + 1, chunk, year)
        })
        .collect()
}

/// Classifies the question and streams the matching strategy's answer over
/// the whole corpus: tokens, then a summary with sources, then done.
pub fn corpus_answer_stream(
    llm: Arc<LlmClient>,
    kb: Arc<KnowledgeBase>,
    question: String,
) -> impl Stream<Item = AnswerEvent> + Send {
    stream! {
        let task = classify(&question);
        let corpus = gather_corpus(&kb);
        if corpus.is_empty() {
            yield AnswerEvent::Error("No indexed documents to search".to_string());
            yield AnswerEvent::Done;
            return;
        }

        let (system_prompt, context, sources) = match task {
            TaskType::Statistical => {
                let hits = statistical_selection(&question, &corpus);
                let sources = sources_from(&hits, false);
                (STATISTICAL_SYSTEM_PROMPT, statistical_context(&hits), sources)
            }
            TaskType::Evolution => {
                let hits = evolution_selection(&question, &corpus);
                let chunks: Vec<Chunk> = hits.iter().map(|(_, c)| c.clone()).collect();
                let sources = sources_from(&chunks, true);
                (EVOLUTION_SYSTEM_PROMPT, evolution_context(&hits), sources)
            }
            TaskType::General => {
                let hits = general_selection(&question, &corpus);
                let sources = sources_from(&hits, false);
                (GENERAL_SYSTEM_PROMPT, general_context(&hits), sources)
            }
        };

        let user_message = format!(
            "Context excerpts:\n==================\n{context}\n\nQuestion:\n==================\n{question}"
        );
        let messages = [
            ChatMessage::system(system_prompt),
            ChatMessage::human(user_message),
        ];

        match llm.complete_stream(&messages).await {
            Ok(mut tokens) => {
                while let Some(token) = tokens.next().await {
                    match token {
                        Ok(token) => yield AnswerEvent::Token(token),
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

        yield AnswerEvent::Summary(QuerySummary::new(sources, Some(task)));
        yield AnswerEvent::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_question_is_statistical() {
        assert_eq!(
            classify("How many times is the harvest mentioned?"),
            TaskType::Statistical
        );
        assert_eq!(classify("List all the people he wrote to"), TaskType::Statistical);
    }

    #[test]
    fn test_change_question_is_evolution() {
        assert_eq!(
            classify("How did the author's view change from 1957 to 1960?"),
            TaskType::Evolution
        );
    }

    #[test]
    fn test_plain_question_is_general() {
        assert_eq!(
            classify("What did the author think of the harvest?"),
            TaskType::General
        );
    }

    #[test]
    fn test_statistical_wins_over_evolution() {
        assert_eq!(
            classify("How many opinions changed from 1957 to 1960?"),
            TaskType::Statistical
        );
    }

    #[test]
    fn test_marker_without_from_to_or_change_is_general() {
        // Known false negative of the rule, kept deliberately
        assert_eq!(
            classify("Describe the evolution of his style"),
            TaskType::General
        );
    }

    #[test]
    fn test_extract_year() {
        assert_eq!(extract_year("1957-letter.txt"), Some("1957"));
        assert_eq!(extract_year("notes-2021-final.md"), Some("2021"));
        assert_eq!(extract_year("letter.txt"), None);
        // Five digits in a row are not a year token
        assert_eq!(extract_year("doc-12019.txt"), None);
        assert_eq!(extract_year("3000-plan.txt"), None);
    }

    #[test]
    fn test_evolution_orders_by_year_not_score() {
        // The 1960 letter repeats the query terms and would win on score
        let corpus = vec![
            Chunk::new(
                "harvest notes from the farm".to_string(),
                "1960-letter.txt".to_string(),
                0,
            ),
            Chunk::new(
                "harvest harvest harvest on the farm farm".to_string(),
                "1960-letter.txt".to_string(),
                1,
            ),
            Chunk::new(
                "a first remark about the harvest".to_string(),
                "1957-letter.txt".to_string(),
                0,
            ),
        ];

        let hits = evolution_selection("harvest farm", &corpus);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].1.metadata.source_document, "1957-letter.txt");
        assert!(hits
            .iter()
            .skip(1)
            .all(|(_, c)| c.metadata.source_document == "1960-letter.txt"));
    }

    #[test]
    fn test_undated_documents_sort_last() {
        let corpus = vec![
            Chunk::new(
                "the harvest was plentiful".to_string(),
                "undated-notes.txt".to_string(),
                0,
            ),
            Chunk::new(
                "the harvest failed that year".to_string(),
                "1957-letter.txt".to_string(),
                0,
            ),
        ];

        let hits = evolution_selection("harvest", &corpus);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].1.metadata.source_document, "1957-letter.txt");
        assert_eq!(hits[1].0, YEAR_SENTINEL);
    }

    #[test]
    fn test_statistical_selection_groups_by_document() {
        let corpus = vec![
            Chunk::new("wheat mention one".to_string(), "b.txt".to_string(), 0),
            Chunk::new("wheat mention two".to_string(), "a.txt".to_string(), 1),
            Chunk::new("wheat mention three".to_string(), "a.txt".to_string(), 0),
        ];

        let hits = statistical_selection("wheat mention", &corpus);
        let order: Vec<(String, usize)> = hits
            .iter()
            .map(|c| (c.metadata.source_document.clone(), c.metadata.ordinal))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a.txt".to_string(), 0),
                ("a.txt".to_string(), 1),
                ("b.txt".to_string(), 0)
            ]
        );
    }

    #[test]
    fn test_general_selection_truncates_to_context_limit() {
        let corpus: Vec<Chunk> = (0..30)
            .map(|i| Chunk::new(format!("shared topic entry {i}"), "doc.txt".to_string(), i))
            .collect();
        let hits = general_selection("shared topic", &corpus);
        assert_eq!(hits.len(), GENERAL_CONTEXT_LIMIT);
    }
}
