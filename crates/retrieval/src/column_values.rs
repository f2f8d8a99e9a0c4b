//! Searchable store of distinct string dimension values.
//!
//! Maps free-text filter terms ("UK", "Great Britain") to the concrete
//! column values queries must compare against.

use crate::entities::ColumnValueRecord;
use sql_agent_common::{Result, Text2SqlError};
use sql_agent_storage::{IndexDocument, SearchIndex, SearchOptions};
use std::sync::Arc;
use tracing::instrument;

pub const DEFAULT_TOP: usize = 5;

pub struct ColumnValueStore {
    index: Arc<dyn SearchIndex>,
}

impl ColumnValueStore {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }

    pub async fn ingest(&self, records: Vec<ColumnValueRecord>) -> Result<()> {
        let documents = records
            .into_iter()
            .map(|record| {
                Ok(IndexDocument {
                    id: format!("{}::{}::{}", record.fqn, record.column, record.value),
                    embed_text: record.embed_text(),
                    payload: serde_json::to_value(&record)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.index.upsert(documents).await
    }

    /// Most relevant concrete values for a free-text filter term. Each
    /// search word carries a fuzzy marker so near-misses still match.
    #[instrument(skip(self))]
    pub async fn get_column_values(&self, search_text: &str, top: usize) -> Result<Vec<ColumnValueRecord>> {
        let fuzzy: String = search_text
            .split_whitespace()
            .map(|word| format!("{word}~"))
            .collect::<Vec<_>>()
            .join(" ");

        let results = self
            .index
            .search(&fuzzy, &SearchOptions::top(top.max(1)))
            .await?;

        results
            .into_iter()
            .map(|result| {
                serde_json::from_value(result.payload)
                    .map_err(|e| Text2SqlError::Search(format!("Malformed column value record: {e}")))
            })
            .collect()
    }
}
