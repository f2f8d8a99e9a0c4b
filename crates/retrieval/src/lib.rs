//! Schema retrieval subsystem: entity schema store, column-value store,
//! query cache, and the entity relationship graph.

pub mod cache;
pub mod column_values;
pub mod entities;
pub mod graph;
pub mod schema_store;

pub use cache::{CacheEntry, CacheHit, QueryCache};
pub use column_values::ColumnValueStore;
pub use entities::{ColumnSchema, ColumnValueRecord, EntityRelationship, EntitySchema, ForeignKeyPair};
pub use graph::EntityGraph;
pub use schema_store::SchemaStore;
