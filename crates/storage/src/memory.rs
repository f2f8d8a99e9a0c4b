//! In-memory hybrid index for tests and single-process local mode.

use crate::embedding::{cosine_similarity, tokenize, Embedder};
use crate::index::{keyword_overlap, IndexDocument, ScoredDocument, SearchIndex, SearchOptions, DENSE_WEIGHT};
use async_trait::async_trait;
use sql_agent_common::Result;
use std::sync::Arc;
use tokio::sync::RwLock;

struct StoredDocument {
    id: String,
    tokens: Vec<String>,
    vector: Vec<f32>,
    payload: serde_json::Value,
}

pub struct InMemorySearchIndex {
    embedder: Arc<dyn Embedder>,
    documents: RwLock<Vec<StoredDocument>>,
}

impl InMemorySearchIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            documents: RwLock::new(Vec::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<ScoredDocument>> {
        let query_vector = self.embedder.embed_one(&query.replace('~', ""))?;
        let documents = self.documents.read().await;

        let mut scored: Vec<ScoredDocument> = documents
            .iter()
            .map(|doc| {
                let dense = cosine_similarity(&query_vector, &doc.vector).max(0.0);
                let keyword = keyword_overlap(query, &doc.tokens);
                ScoredDocument {
                    payload: doc.payload.clone(),
                    score: DENSE_WEIGHT * dense + (1.0 - DENSE_WEIGHT) * keyword,
                }
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        if let Some(minimum) = options.minimum_score {
            scored.retain(|d| d.score >= minimum);
        }
        scored.truncate(options.top);
        Ok(scored)
    }

    async fn upsert(&self, new_documents: Vec<IndexDocument>) -> Result<()> {
        let mut vectors = self
            .embedder
            .embed(&new_documents.iter().map(|d| d.embed_text.clone()).collect::<Vec<_>>())?;
        let mut documents = self.documents.write().await;

        for document in new_documents.into_iter().rev() {
            let vector = vectors.pop().unwrap_or_default();
            let stored = StoredDocument {
                tokens: tokenize(&document.embed_text),
                vector,
                id: document.id,
                payload: document.payload,
            };
            if let Some(existing) = documents.iter_mut().find(|d| d.id == stored.id) {
                *existing = stored;
            } else {
                documents.push(stored);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use serde_json::json;

    fn index() -> InMemorySearchIndex {
        InMemorySearchIndex::new(Arc::new(HashEmbedder::new(256)))
    }

    fn doc(id: &str, text: &str) -> IndexDocument {
        IndexDocument {
            id: id.to_string(),
            embed_text: text.to_string(),
            payload: json!({ "id": id }),
        }
    }

    #[tokio::test]
    async fn search_prefers_matching_documents() {
        let index = index();
        index
            .upsert(vec![
                doc("orders", "sales order header with order date and total due"),
                doc("products", "product catalog with list price and category"),
            ])
            .await
            .unwrap();

        let results = index
            .search("how many orders by order date", &SearchOptions::top(2))
            .await
            .unwrap();
        assert_eq!(results[0].payload["id"], "orders");
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let index = index();
        index.upsert(vec![doc("a", "first text")]).await.unwrap();
        index.upsert(vec![doc("a", "replacement text")]).await.unwrap();
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn minimum_score_filters_weak_results() {
        let index = index();
        index.upsert(vec![doc("a", "completely unrelated content")]).await.unwrap();

        let options = SearchOptions {
            top: 5,
            minimum_score: Some(0.9),
        };
        let results = index.search("orders in 2008", &options).await.unwrap();
        assert!(results.is_empty());
    }
}
