//! Text embedders behind a trait so search backends stay model-agnostic.

use sql_agent_common::{Result, Text2SqlError};

pub trait Embedder: Send + Sync {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;

    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string()))?;
        vectors
            .pop()
            .ok_or_else(|| Text2SqlError::Search("Embedder returned no vector".to_string()))
    }
}

/// ONNX-backed sentence embedder used in deployments.
#[cfg(feature = "local-embeddings")]
pub struct FastEmbedder {
    model: fastembed::TextEmbedding,
    dimension: usize,
}

#[cfg(feature = "local-embeddings")]
impl FastEmbedder {
    pub fn new() -> anyhow::Result<Self> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
        let options = InitOptions::new(EmbeddingModel::AllMiniLML6V2);
        let model = TextEmbedding::try_new(options)?;
        Ok(Self {
            model,
            dimension: 384,
        })
    }
}

#[cfg(feature = "local-embeddings")]
impl Embedder for FastEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.model
            .embed(texts.to_vec(), None)
            .map_err(|e| Text2SqlError::Search(format!("Embedding failed: {e}")))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic hashed bag-of-words embedder. No model download, stable
/// across processes, good enough for tests and single-tenant local mode
/// where the keyword leg of hybrid search does most of the work.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

impl HashEmbedder {
    fn embed_text(&self, text: &str) -> Vec<f32> {
        use sha2::{Digest, Sha256};

        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes(digest[..8].try_into().unwrap()) as usize % self.dimension;
            // Sign from a second hash byte spreads tokens over both halves.
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

/// Lowercased alphanumeric tokens; `~` fuzzy markers are stripped.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed_one("total sales by country").unwrap();
        let b = embedder.embed_one("total sales by country").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let embedder = HashEmbedder::new(256);
        let query = embedder.embed_one("orders in 2008").unwrap();
        let close = embedder.embed_one("how many orders were there in 2008").unwrap();
        let far = embedder.embed_one("employee birthday calendar").unwrap();
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn tokenizer_strips_fuzzy_markers() {
        assert_eq!(tokenize("United~ Kingdom~"), vec!["united", "kingdom"]);
    }
}
