//! Embedding and vector-store capabilities.
//!
//! The semantic memory tier and the experience store both sit on these two
//! traits. A store holds named collections of points; each point has a
//! vector and a JSON payload that filters match against.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::MemoryError;

/// Turns text into a dense vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// A human-readable name for this embedder.
    fn name(&self) -> &str;

    /// Dimensionality of produced vectors.
    fn dimensions(&self) -> usize;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}

/// A stored point: id, vector, and payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// A nearest-neighbour hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub id: String,
    /// Similarity score (cosine for the bundled stores)
    pub score: f32,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// A conjunction of payload equality conditions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadFilter {
    pub must: Vec<(String, serde_json::Value)>,
}

impl PayloadFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `payload[key] == value`.
    pub fn eq(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.must.push((key.to_string(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    /// Whether a payload satisfies every condition.
    pub fn matches(&self, payload: &serde_json::Map<String, serde_json::Value>) -> bool {
        self.must
            .iter()
            .all(|(key, value)| payload.get(key) == Some(value))
    }
}

/// The vector database capability.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// The backend name (e.g., "in_memory", "sqlite").
    fn name(&self) -> &str;

    /// Create the collection if it does not exist yet.
    async fn ensure_collection(&self, collection: &str, dimensions: usize) -> Result<(), MemoryError>;

    /// Insert or replace points by id.
    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), MemoryError>;

    /// Nearest-neighbour query, best first, keeping hits with `score >= score_threshold`.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredRecord>, MemoryError>;

    /// List points matching a filter without a vector query. Order is unspecified.
    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&PayloadFilter>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, MemoryError>;

    /// Number of points in a collection.
    async fn count(&self, collection: &str) -> Result<usize, MemoryError>;

    /// Remove every point from a collection.
    async fn clear_collection(&self, collection: &str) -> Result<(), MemoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_all_conditions() {
        let mut payload = serde_json::Map::new();
        payload.insert("success".into(), serde_json::Value::Bool(false));
        payload.insert("intent".into(), "calculation".into());

        let filter = PayloadFilter::new().eq("success", false).eq("intent", "calculation");
        assert!(filter.matches(&payload));

        let other = PayloadFilter::new().eq("success", true);
        assert!(!other.matches(&payload));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = PayloadFilter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&serde_json::Map::new()));
    }

    #[test]
    fn missing_field_does_not_match() {
        let filter = PayloadFilter::new().eq("tool_called", "calculator");
        assert!(!filter.matches(&serde_json::Map::new()));
    }
}
