//! Query cache: previously answered questions with their SQL templates.
//!
//! Lookup is by question similarity against the hybrid index. Cached SQL
//! is a Jinja template rendered at lookup time with the whitelisted
//! parameters only; the template environment has no loader and no
//! callbacks, so nothing outside the supplied context is reachable.

use crate::entities::EntitySchema;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sql_agent_common::config::CacheWriteStrategy;
use sql_agent_common::{Result, Text2SqlError};
use sql_agent_storage::{IndexDocument, SearchIndex, SearchOptionsBuilder};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub question: String,
    /// Jinja template; placeholders are the whitelisted defaults plus
    /// request-supplied parameters.
    pub sql_template: String,
    pub schemas: Vec<EntitySchema>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(question: impl Into<String>, sql_template: impl Into<String>, schemas: Vec<EntitySchema>) -> Self {
        Self {
            question: question.into(),
            sql_template: sql_template.into(),
            schemas,
            created_at: Utc::now(),
        }
    }
}

/// A cache hit with the template already rendered. `pre_run_rows` is
/// attached by the caller after re-executing the SQL; rows are refreshed,
/// never served stale.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub question: String,
    pub sql: String,
    pub schemas: Vec<EntitySchema>,
    pub score: f32,
    pub pre_run_rows: Option<sql_agent_common::QueryResult>,
}

pub struct QueryCache {
    index: Arc<dyn SearchIndex>,
    hit_threshold: f32,
    strategy: CacheWriteStrategy,
    offline_batch: Mutex<Vec<CacheEntry>>,
}

impl QueryCache {
    pub fn new(index: Arc<dyn SearchIndex>, hit_threshold: f32, strategy: CacheWriteStrategy) -> Self {
        Self {
            index,
            hit_threshold,
            strategy,
            offline_batch: Mutex::new(Vec::new()),
        }
    }

    /// Best cached question at or above the hit threshold, template
    /// rendered. A template that fails to render demotes the hit to a
    /// miss rather than failing the run.
    #[instrument(skip(self, parameters))]
    pub async fn lookup(
        &self,
        question: &str,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<Option<CacheHit>> {
        let options = SearchOptionsBuilder::default()
            .top(1usize)
            .build()
            .map_err(|e| Text2SqlError::Search(e.to_string()))?;
        let results = self.index.search(question, &options).await?;

        let Some(best) = results.into_iter().next() else {
            return Ok(None);
        };
        if best.score < self.hit_threshold {
            debug!(score = best.score, threshold = self.hit_threshold, "Cache miss: below threshold");
            return Ok(None);
        }

        let entry: CacheEntry = serde_json::from_value(best.payload)
            .map_err(|e| Text2SqlError::Search(format!("Malformed cache entry: {e}")))?;

        match render_template(&entry.sql_template, parameters) {
            Ok(sql) => {
                info!(question = %entry.question, score = best.score, "Cache hit");
                Ok(Some(CacheHit {
                    question: entry.question,
                    sql,
                    schemas: entry.schemas,
                    score: best.score,
                    pre_run_rows: None,
                }))
            }
            Err(e) => {
                warn!(error = %e, "Cache entry failed to render; treating as miss");
                Ok(None)
            }
        }
    }

    /// Write one entry according to the configured strategy.
    pub async fn write(&self, entry: CacheEntry) -> Result<()> {
        match self.strategy {
            CacheWriteStrategy::Always => self.upsert(entry).await,
            CacheWriteStrategy::Never | CacheWriteStrategy::PositiveFeedbackOnly => Ok(()),
            CacheWriteStrategy::OfflineBatch => {
                self.offline_batch.lock().await.push(entry);
                Ok(())
            }
        }
    }

    /// Strategy `positive_feedback_only` writes here once the caller
    /// reports the answer was good.
    pub async fn write_with_feedback(&self, entry: CacheEntry, positive: bool) -> Result<()> {
        match self.strategy {
            CacheWriteStrategy::PositiveFeedbackOnly if positive => self.upsert(entry).await,
            CacheWriteStrategy::PositiveFeedbackOnly => Ok(()),
            _ => self.write(entry).await,
        }
    }

    /// Entries accumulated under the `offline_batch` strategy.
    pub async fn drain_offline_batch(&self) -> Vec<CacheEntry> {
        std::mem::take(&mut *self.offline_batch.lock().await)
    }

    async fn upsert(&self, entry: CacheEntry) -> Result<()> {
        let document = IndexDocument {
            id: question_key(&entry.question),
            embed_text: entry.question.clone(),
            payload: serde_json::to_value(&entry)
                .map_err(|e| Text2SqlError::CacheWrite(e.to_string()))?,
        };
        self.index
            .upsert(vec![document])
            .await
            .map_err(|e| Text2SqlError::CacheWrite(e.to_string()))
    }
}

/// Render a cache SQL template with the supplied parameters.
pub fn render_template(template: &str, parameters: &BTreeMap<String, Value>) -> Result<String> {
    let env = minijinja::Environment::new();
    env.render_str(template, parameters)
        .map_err(|e| Text2SqlError::CacheWrite(format!("Template render failed: {e}")))
}

/// Last-writer-wins key: hash of the normalized question text.
pub fn question_key(question: &str) -> String {
    let normalized = question.trim().to_lowercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}
