//! Per-thread agent state persistence across invocations.
//!
//! The only cross-process mutable state in the pipeline. Entries are
//! versioned; a version mismatch invalidates the entry so a resumed
//! thread restarts cleanly instead of mis-routing.

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use sql_agent_common::{Result, ThreadId};
use std::time::Duration;
use tracing::warn;

/// Bump on any incompatible change to the serialized run snapshot.
pub const STATE_SCHEMA_VERSION: u32 = 2;

const DEFAULT_CAPACITY: u64 = 10_000;
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub thread_id: ThreadId,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub trait StateStore: Send + Sync {
    /// Fetch the snapshot for a thread. Entries written under a different
    /// schema version are dropped, not returned.
    fn get(&self, thread_id: &ThreadId) -> Option<PersistedState>;

    fn save(&self, thread_id: &ThreadId, state: serde_json::Value) -> Result<()>;

    fn clear(&self, thread_id: &ThreadId);
}

/// TTL-bounded in-memory store. Suspended threads that are never resumed
/// expire instead of accumulating forever.
pub struct InMemoryStateStore {
    cache: Cache<String, PersistedState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(DEFAULT_CAPACITY)
                .time_to_live(ttl)
                .build(),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, thread_id: &ThreadId) -> Option<PersistedState> {
        let entry = self.cache.get(&thread_id.0)?;
        if entry.version != STATE_SCHEMA_VERSION {
            warn!(
                thread_id = %thread_id,
                found = entry.version,
                expected = STATE_SCHEMA_VERSION,
                "Discarding state snapshot with mismatched schema version"
            );
            self.cache.invalidate(&thread_id.0);
            return None;
        }
        Some(entry)
    }

    fn save(&self, thread_id: &ThreadId, state: serde_json::Value) -> Result<()> {
        let now = Utc::now();
        let created_at = self
            .cache
            .get(&thread_id.0)
            .map(|existing| existing.created_at)
            .unwrap_or(now);
        self.cache.insert(
            thread_id.0.clone(),
            PersistedState {
                version: STATE_SCHEMA_VERSION,
                thread_id: thread_id.clone(),
                state,
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    fn clear(&self, thread_id: &ThreadId) {
        self.cache.invalidate(&thread_id.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn save_and_get_round_trip() {
        let store = InMemoryStateStore::new();
        let thread = ThreadId::from_string("t1".into());
        store.save(&thread, json!({"current_round": 1})).unwrap();

        let state = store.get(&thread).unwrap();
        assert_eq!(state.version, STATE_SCHEMA_VERSION);
        assert_eq!(state.state["current_round"], 1);
    }

    #[test]
    fn version_mismatch_invalidates() {
        let store = InMemoryStateStore::new();
        let thread = ThreadId::from_string("t2".into());
        store.save(&thread, json!({})).unwrap();

        // Corrupt the stored version to simulate an old snapshot.
        let mut stale = store.cache.get(&thread.0).unwrap();
        stale.version = STATE_SCHEMA_VERSION - 1;
        store.cache.insert(thread.0.clone(), stale);

        assert!(store.get(&thread).is_none());
        assert!(store.get(&thread).is_none(), "entry stays invalidated");
    }

    #[test]
    fn clear_removes_the_thread() {
        let store = InMemoryStateStore::new();
        let thread = ThreadId::from_string("t3".into());
        store.save(&thread, json!({})).unwrap();
        store.clear(&thread);
        assert!(store.get(&thread).is_none());
    }
}
