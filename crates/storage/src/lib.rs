//! Search index and state persistence backends.
//!
//! Hybrid (vector + keyword) search behind the [`index::SearchIndex`]
//! trait, with a Qdrant implementation for deployments and an in-memory
//! implementation for tests and local mode.

pub mod embedding;
pub mod index;
pub mod memory;
pub mod qdrant;
pub mod state;

pub use embedding::{Embedder, HashEmbedder};
pub use index::{IndexDocument, ScoredDocument, SearchIndex, SearchOptions, SearchOptionsBuilder};
pub use memory::InMemorySearchIndex;
pub use qdrant::QdrantSearchIndex;
pub use state::{InMemoryStateStore, PersistedState, StateStore, STATE_SCHEMA_VERSION};
