//! Qdrant-backed hybrid search index.
//!
//! Dense retrieval runs server-side; the keyword leg and final rerank run
//! in process over the returned candidates, so combined scores match the
//! in-memory backend.

use crate::embedding::{tokenize, Embedder};
use crate::index::{keyword_overlap, IndexDocument, ScoredDocument, SearchIndex, SearchOptions, DENSE_WEIGHT};
use async_trait::async_trait;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::{
    CreateCollectionBuilder, Distance, ListValue, PointStruct, SearchPointsBuilder, Struct,
    UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use sha2::{Digest, Sha256};
use sql_agent_common::{Result, Text2SqlError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Payload field carrying the searchable text for the keyword leg.
const SEARCH_TEXT_FIELD: &str = "__search_text";

/// Candidate multiplier: fetch more than `top` from the dense leg so the
/// keyword rerank has something to reorder.
const CANDIDATE_FACTOR: usize = 4;

pub struct QdrantSearchIndex {
    client: Arc<Qdrant>,
    collection: String,
    embedder: Arc<dyn Embedder>,
}

impl QdrantSearchIndex {
    pub fn new(client: Arc<Qdrant>, collection: impl Into<String>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            client,
            collection: collection.into(),
            embedder,
        }
    }

    pub fn connect(url: &str, collection: impl Into<String>, embedder: Arc<dyn Embedder>) -> anyhow::Result<Self> {
        let client = Qdrant::from_url(url).build()?;
        Ok(Self::new(Arc::new(client), collection, embedder))
    }

    /// Create the backing collection when missing. Called once at wiring
    /// time, not on the query path.
    pub async fn ensure_collection(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| Text2SqlError::Search(e.to_string()))?;
        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection).vectors_config(
                        VectorParamsBuilder::new(self.embedder.dimension() as u64, Distance::Cosine),
                    ),
                )
                .await
                .map_err(|e| Text2SqlError::Search(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for QdrantSearchIndex {
    #[instrument(skip(self, options), fields(collection = %self.collection))]
    async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<ScoredDocument>> {
        let query_vector = self.embedder.embed_one(&query.replace('~', ""))?;

        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(
                    &self.collection,
                    query_vector,
                    (options.top * CANDIDATE_FACTOR) as u64,
                )
                .with_payload(true),
            )
            .await
            .map_err(|e| Text2SqlError::Search(e.to_string()))?;

        let mut scored: Vec<ScoredDocument> = response
            .result
            .into_iter()
            .map(|point| {
                let mut payload = payload_to_json(point.payload);
                let search_text = payload
                    .as_object_mut()
                    .and_then(|map| map.remove(SEARCH_TEXT_FIELD))
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                let keyword = keyword_overlap(query, &tokenize(&search_text));
                ScoredDocument {
                    payload,
                    score: DENSE_WEIGHT * point.score.max(0.0) + (1.0 - DENSE_WEIGHT) * keyword,
                }
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        if let Some(minimum) = options.minimum_score {
            scored.retain(|d| d.score >= minimum);
        }
        scored.truncate(options.top);
        debug!(results = scored.len(), "hybrid search complete");
        Ok(scored)
    }

    async fn upsert(&self, documents: Vec<IndexDocument>) -> Result<()> {
        let vectors = self
            .embedder
            .embed(&documents.iter().map(|d| d.embed_text.clone()).collect::<Vec<_>>())?;

        let points: Vec<PointStruct> = documents
            .into_iter()
            .zip(vectors)
            .map(|(document, vector)| {
                let mut payload_json = document.payload;
                if let Some(map) = payload_json.as_object_mut() {
                    map.insert(
                        SEARCH_TEXT_FIELD.to_string(),
                        serde_json::Value::String(document.embed_text.clone()),
                    );
                }
                let payload: Payload = payload_json
                    .try_into()
                    .unwrap_or_else(|_| Payload::new());
                PointStruct::new(point_id(&document.id), vector, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points))
            .await
            .map_err(|e| Text2SqlError::Search(e.to_string()))?;
        Ok(())
    }
}

/// Stable numeric point id derived from the document id. Re-upserting the
/// same id overwrites the previous point (last writer wins).
fn point_id(id: &str) -> u64 {
    let digest = Sha256::digest(id.as_bytes());
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

fn payload_to_json(payload: HashMap<String, QdrantValue>) -> serde_json::Value {
    serde_json::Value::Object(
        payload
            .into_iter()
            .map(|(key, value)| (key, qdrant_value_to_json(value)))
            .collect(),
    )
}

fn qdrant_value_to_json(value: QdrantValue) -> serde_json::Value {
    match value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::IntegerValue(i)) => serde_json::Value::from(i),
        Some(Kind::DoubleValue(d)) => serde_json::Value::from(d),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::ListValue(ListValue { values })) => {
            serde_json::Value::Array(values.into_iter().map(qdrant_value_to_json).collect())
        }
        Some(Kind::StructValue(Struct { fields })) => serde_json::Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key, qdrant_value_to_json(value)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_stable_per_document() {
        assert_eq!(point_id("question-1"), point_id("question-1"));
        assert_ne!(point_id("question-1"), point_id("question-2"));
    }

    #[test]
    fn qdrant_values_convert_to_json() {
        let value = QdrantValue {
            kind: Some(Kind::ListValue(ListValue {
                values: vec![
                    QdrantValue { kind: Some(Kind::StringValue("a".into())) },
                    QdrantValue { kind: Some(Kind::IntegerValue(3)) },
                ],
            })),
        };
        assert_eq!(qdrant_value_to_json(value), serde_json::json!(["a", 3]));
    }
}
