//! Hybrid search contract shared by the Qdrant and in-memory backends.

use async_trait::async_trait;
use derive_builder::Builder;
use serde_json::Value;
use sql_agent_common::Result;

/// Weight of the dense leg in the combined score; the keyword-overlap leg
/// gets the remainder. Scores land in [0, 1] so hit thresholds are
/// backend-independent.
pub const DENSE_WEIGHT: f32 = 0.7;

/// A document to be indexed: `embed_text` feeds the dense vector and the
/// keyword leg, `payload` is returned verbatim on retrieval.
#[derive(Debug, Clone)]
pub struct IndexDocument {
    pub id: String,
    pub embed_text: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub payload: Value,
    pub score: f32,
}

#[derive(Debug, Clone, Builder)]
#[builder(setter(into), default)]
pub struct SearchOptions {
    /// Number of documents to return after reranking.
    pub top: usize,
    /// Drop results below this combined score.
    pub minimum_score: Option<f32>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top: 5,
            minimum_score: None,
        }
    }
}

impl SearchOptions {
    pub fn top(top: usize) -> Self {
        Self {
            top,
            minimum_score: None,
        }
    }
}

/// Hybrid (dense + keyword, reranked) search over one collection.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<ScoredDocument>>;

    /// Insert or replace by document id. Last writer wins.
    async fn upsert(&self, documents: Vec<IndexDocument>) -> Result<()>;
}

/// Keyword-overlap score: fraction of query tokens present in the
/// document tokens. Trailing `~` fuzzy markers on query words fall back
/// to prefix matching.
pub fn keyword_overlap(query: &str, document_tokens: &[String]) -> f32 {
    let query_words: Vec<(String, bool)> = query
        .split_whitespace()
        .map(|w| {
            let fuzzy = w.ends_with('~');
            (w.trim_end_matches('~').to_lowercase(), fuzzy)
        })
        .filter(|(w, _)| !w.is_empty())
        .collect();
    if query_words.is_empty() {
        return 0.0;
    }

    let matched = query_words
        .iter()
        .filter(|(word, fuzzy)| {
            document_tokens.iter().any(|t| {
                if *fuzzy {
                    t.starts_with(word.as_str()) || word.starts_with(t.as_str())
                } else {
                    t == word
                }
            })
        })
        .count();

    matched as f32 / query_words.len() as f32
}
