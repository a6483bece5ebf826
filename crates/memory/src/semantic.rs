//! Semantic index: embed text, store it, and search it with a recency boost.
//!
//! Shared by the dual-tier conversation memory and the experience store.
//! Every indexed payload carries an RFC 3339 `timestamp` field; search
//! over-fetches nearest neighbours, multiplies each similarity by the
//! freshness boost of its timestamp, and re-sorts.

use chrono::{DateTime, Duration, Utc};
use kestrel_config::MemoryConfig;
use kestrel_core::error::MemoryError;
use kestrel_core::vector::{Embedder, PayloadFilter, VectorRecord, VectorStore};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Nearest-neighbour candidates fetched per requested result before re-ranking.
const OVERFETCH: usize = 3;

/// Multiplicative freshness boost applied to raw similarity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecencyBoost {
    /// Applied to matches younger than one hour
    pub hour: f32,
    /// Applied to matches younger than one day
    pub day: f32,
}

impl Default for RecencyBoost {
    fn default() -> Self {
        Self { hour: 1.2, day: 1.1 }
    }
}

impl From<&MemoryConfig> for RecencyBoost {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            hour: config.hour_boost,
            day: config.day_boost,
        }
    }
}

impl RecencyBoost {
    /// Boost for an item stored at `timestamp`, evaluated at `now`.
    pub fn factor(&self, timestamp: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f32 {
        let Some(ts) = timestamp else {
            return 1.0;
        };
        let age = now.signed_duration_since(ts);
        if age < Duration::hours(1) {
            self.hour
        } else if age < Duration::hours(24) {
            self.day
        } else {
            1.0
        }
    }
}

/// A search hit after recency re-ranking.
#[derive(Debug, Clone)]
pub struct RankedHit {
    pub id: String,
    /// Raw similarity from the vector store
    pub similarity: f32,
    /// Similarity times the recency boost
    pub score: f32,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Read the `timestamp` field of a payload.
pub fn payload_timestamp(payload: &serde_json::Map<String, serde_json::Value>) -> Option<DateTime<Utc>> {
    payload
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// One embedder + one vector-store collection.
pub struct SemanticIndex {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    collection: String,
    boost: RecencyBoost,
    ready: OnceCell<()>,
}

impl SemanticIndex {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>, collection: impl Into<String>) -> Self {
        Self {
            embedder,
            store,
            collection: collection.into(),
            boost: RecencyBoost::default(),
            ready: OnceCell::new(),
        }
    }

    pub fn with_boost(mut self, boost: RecencyBoost) -> Self {
        self.boost = boost;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Create the collection on first use.
    async fn ensure_ready(&self) -> Result<(), MemoryError> {
        self.ready
            .get_or_try_init(|| async {
                self.store
                    .ensure_collection(&self.collection, self.embedder.dimensions())
                    .await
            })
            .await
            .map(|_| ())
    }

    /// Embed `text` and upsert it under `id`. A missing `timestamp` payload
    /// field is filled with the current time.
    pub async fn index(
        &self,
        id: &str,
        text: &str,
        mut payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), MemoryError> {
        self.ensure_ready().await?;
        let vector = self.embedder.embed(text).await?;
        payload
            .entry("timestamp")
            .or_insert_with(|| Utc::now().to_rfc3339().into());

        self.store
            .upsert(
                &self.collection,
                vec![VectorRecord {
                    id: id.to_string(),
                    vector,
                    payload,
                }],
            )
            .await?;
        debug!(collection = %self.collection, id, "Indexed point");
        Ok(())
    }

    /// Nearest neighbours of `text`, re-ranked by recency.
    ///
    /// `min_similarity` applies to the raw similarity, before boosting.
    pub async fn search(
        &self,
        text: &str,
        limit: usize,
        min_similarity: f32,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<RankedHit>, MemoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.ensure_ready().await?;
        let vector = self.embedder.embed(text).await?;
        let candidates = self
            .store
            .search(&self.collection, &vector, limit * OVERFETCH, min_similarity, filter)
            .await?;

        let now = Utc::now();
        let mut hits: Vec<RankedHit> = candidates
            .into_iter()
            .map(|c| {
                let ts = payload_timestamp(&c.payload);
                RankedHit {
                    score: c.score * self.boost.factor(ts, now),
                    similarity: c.score,
                    id: c.id,
                    payload: c.payload,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| payload_timestamp(&b.payload).cmp(&payload_timestamp(&a.payload)))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Points matching `filter`, without a similarity query.
    pub async fn scroll(
        &self,
        filter: Option<&PayloadFilter>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, MemoryError> {
        self.ensure_ready().await?;
        self.store.scroll(&self.collection, filter, limit).await
    }

    pub async fn count(&self) -> Result<usize, MemoryError> {
        self.ensure_ready().await?;
        self.store.count(&self.collection).await
    }

    pub async fn clear(&self) -> Result<(), MemoryError> {
        self.ensure_ready().await?;
        self.store.clear_collection(&self.collection).await
    }
}
