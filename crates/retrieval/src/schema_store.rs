//! Hybrid-searchable store of entity schema documents.

use crate::entities::EntitySchema;
use crate::graph::EntityGraph;
use sql_agent_common::{DatabaseEngine, Result, Text2SqlError};
use sql_agent_storage::{IndexDocument, SearchIndex, SearchOptions};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// Default number of entities returned per lookup.
pub const DEFAULT_TOP: usize = 3;

pub struct SchemaStore {
    index: Arc<dyn SearchIndex>,
    engine: DatabaseEngine,
    graph: RwLock<EntityGraph>,
}

impl SchemaStore {
    pub fn new(index: Arc<dyn SearchIndex>, engine: DatabaseEngine) -> Self {
        Self {
            index,
            engine,
            graph: RwLock::new(EntityGraph::default()),
        }
    }

    /// Index entity documents and rebuild the relationship graph.
    /// Entities are immutable at runtime; this runs at startup.
    pub async fn ingest(&self, entities: Vec<EntitySchema>) -> Result<()> {
        info!(count = entities.len(), "Ingesting entity schemas");
        *self.graph.write().await = EntityGraph::from_entities(&entities);

        let documents = entities
            .into_iter()
            .map(|entity| {
                Ok(IndexDocument {
                    id: entity.fqn.clone(),
                    embed_text: entity.embed_text(),
                    payload: serde_json::to_value(&entity)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.index.upsert(documents).await
    }

    /// Top-n entity documents for a search term. Entities already in hand
    /// are filtered out by their short name, case-insensitively.
    #[instrument(skip(self, excluded_entities))]
    pub async fn get_entity_schemas(
        &self,
        search_text: &str,
        top: usize,
        excluded_entities: &[String],
    ) -> Result<Vec<EntitySchema>> {
        let results = self
            .index
            .search(search_text, &SearchOptions::top(top.max(1)))
            .await?;

        let excluded: Vec<String> = excluded_entities.iter().map(|e| e.to_lowercase()).collect();
        let mut schemas: Vec<EntitySchema> = Vec::new();
        for result in results {
            let mut schema: EntitySchema = serde_json::from_value(result.payload)
                .map_err(|e| Text2SqlError::Search(format!("Malformed schema document: {e}")))?;
            if excluded.contains(&schema.entity.to_lowercase()) {
                debug!(entity = %schema.entity, "Excluding entity already in hand");
                continue;
            }
            if schemas.iter().any(|s: &EntitySchema| s.fqn == schema.fqn) {
                continue;
            }
            schema.trim_engine_fields(self.engine);
            schemas.push(schema);
        }

        if schemas.is_empty() {
            return Err(Text2SqlError::SchemaNotFound(search_text.to_string()));
        }
        Ok(schemas)
    }

    /// Shortest join path between two entities, endpoints included.
    pub async fn find_join_path(&self, from_fqn: &str, to_fqn: &str) -> Option<Vec<String>> {
        self.graph.read().await.find_join_path(from_fqn, to_fqn)
    }

    pub fn engine(&self) -> DatabaseEngine {
        self.engine
    }
}
