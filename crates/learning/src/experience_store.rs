//! Append-only experience log over the semantic index.
//!
//! Each experience is stored as one point: the vector is the embedding of its
//! query, the payload is the serialized experience. Filters on `success`,
//! `intent`, and `tool_called` are pushed down to the vector store.

use kestrel_core::error::{LearningError, MemoryError};
use kestrel_core::experience::{Experience, Intent, UNKNOWN_ERROR};
use kestrel_core::vector::{Embedder, PayloadFilter, VectorStore};
use kestrel_memory::{RecencyBoost, SemanticIndex};
use std::sync::Arc;
use tracing::{debug, warn};

/// Collection holding experience records.
pub const EXPERIENCE_COLLECTION: &str = "experiences";

/// Filters for [`ExperienceStore::query`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExperienceQuery {
    /// Free text to match by similarity; `None` returns newest first
    pub text: Option<String>,
    pub success: Option<bool>,
    pub intent: Option<Intent>,
    pub tool: Option<String>,
    /// Minimum raw similarity, only meaningful with `text`
    pub min_similarity: f32,
    pub limit: usize,
}

impl ExperienceQuery {
    /// The newest `limit` experiences.
    pub fn recent(limit: usize) -> Self {
        Self {
            text: None,
            success: None,
            intent: None,
            tool: None,
            min_similarity: 0.0,
            limit,
        }
    }

    /// Experiences whose query resembles `text`, most similar first.
    pub fn similar_to(text: impl Into<String>, min_similarity: f32, limit: usize) -> Self {
        Self {
            text: Some(text.into()),
            min_similarity,
            ..Self::recent(limit)
        }
    }

    pub fn failures(mut self) -> Self {
        self.success = Some(false);
        self
    }

    pub fn successes(mut self) -> Self {
        self.success = Some(true);
        self
    }

    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    fn filter(&self) -> Option<PayloadFilter> {
        let mut filter = PayloadFilter::new();
        if let Some(success) = self.success {
            filter = filter.eq("success", success);
        }
        if let Some(intent) = self.intent {
            filter = filter.eq("intent", intent.as_str());
        }
        if let Some(tool) = &self.tool {
            filter = filter.eq("tool_called", tool.as_str());
        }
        (!filter.is_empty()).then_some(filter)
    }
}

/// The experience log.
///
/// Without a backing index the store runs in degraded mode: `record` reports
/// [`LearningError::StoreUnavailable`] and queries return nothing.
pub struct ExperienceStore {
    index: Option<SemanticIndex>,
}

impl ExperienceStore {
    pub fn new(index: SemanticIndex) -> Self {
        Self { index: Some(index) }
    }

    /// Store over the experiences collection of `store`.
    pub fn open(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>, boost: RecencyBoost) -> Self {
        Self::new(SemanticIndex::new(embedder, store, EXPERIENCE_COLLECTION).with_boost(boost))
    }

    /// A store with no persistence.
    pub fn disabled() -> Self {
        Self { index: None }
    }

    pub fn is_available(&self) -> bool {
        self.index.is_some()
    }

    fn index(&self) -> Result<&SemanticIndex, LearningError> {
        self.index
            .as_ref()
            .ok_or_else(|| LearningError::StoreUnavailable("no vector store configured".into()))
    }

    /// Append one experience.
    pub async fn record(&self, experience: &Experience) -> Result<(), LearningError> {
        let index = self.index()?;

        let mut experience = experience.clone();
        if !experience.success && experience.error.trim().is_empty() {
            experience.error = UNKNOWN_ERROR.to_string();
        }
        if experience.success {
            experience.error.clear();
        }

        let payload = experience
            .to_payload()
            .map_err(|e| MemoryError::Storage(format!("experience payload: {e}")))?;
        let text = if experience.query.trim().is_empty() {
            experience.intent.as_str()
        } else {
            experience.query.as_str()
        };

        index.index(&experience.id, text, payload).await?;
        debug!(
            experience_id = %experience.id,
            success = experience.success,
            tool = experience.tool_called.as_deref().unwrap_or("-"),
            "Experience recorded"
        );
        Ok(())
    }

    /// Experiences matching `query`.
    ///
    /// With text: raw similarity `>= min_similarity`, ranked by
    /// recency-boosted similarity. Without text: newest first.
    pub async fn query(&self, query: &ExperienceQuery) -> Result<Vec<Experience>, LearningError> {
        let Some(index) = &self.index else {
            return Ok(Vec::new());
        };
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let filter = query.filter();

        let experiences = match &query.text {
            Some(text) if !text.trim().is_empty() => index
                .search(text, query.limit, query.min_similarity, filter.as_ref())
                .await?
                .into_iter()
                .filter_map(|hit| decode(&hit.id, &hit.payload))
                .collect(),
            _ => {
                let mut all: Vec<Experience> = index
                    .scroll(filter.as_ref(), usize::MAX)
                    .await?
                    .into_iter()
                    .filter_map(|point| decode(&point.id, &point.payload))
                    .collect();
                all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                all.truncate(query.limit);
                all
            }
        };
        Ok(experiences)
    }

    /// The newest `limit` failed experiences.
    pub async fn get_all_failures(&self, limit: usize) -> Result<Vec<Experience>, LearningError> {
        self.query(&ExperienceQuery::recent(limit).failures()).await
    }

    /// Number of stored experiences; `0` in degraded mode.
    pub async fn count(&self) -> Result<usize, LearningError> {
        match &self.index {
            Some(index) => Ok(index.count().await?),
            None => Ok(0),
        }
    }

    pub async fn clear(&self) -> Result<(), LearningError> {
        match &self.index {
            Some(index) => Ok(index.clear().await?),
            None => Ok(()),
        }
    }
}

fn decode(id: &str, payload: &serde_json::Map<String, serde_json::Value>) -> Option<Experience> {
    match Experience::from_payload(payload) {
        Ok(exp) => Some(exp),
        Err(e) => {
            warn!(point_id = id, error = %e, "Skipping undecodable experience");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use kestrel_core::experience::ReasoningMode;
    use kestrel_core::message::ConversationId;
    use kestrel_memory::{HashingEmbedder, InMemoryVectorStore};

    pub(crate) fn memory_store() -> ExperienceStore {
        ExperienceStore::open(
            Arc::new(HashingEmbedder::new(128)),
            Arc::new(InMemoryVectorStore::new()),
            RecencyBoost::default(),
        )
    }

    pub(crate) fn success(query: &str, tool: &str, intent: Intent, latency_ms: u64) -> Experience {
        Experience::succeeded(query, "ok", intent, ReasoningMode::ToolUse, &ConversationId::from("t"))
            .with_tool(tool, None)
            .with_latency(latency_ms)
    }

    pub(crate) fn failure(query: &str, tool: &str, intent: Intent, error: &str) -> Experience {
        Experience::failed(query, error, intent, ReasoningMode::ToolUse, &ConversationId::from("t"))
            .with_tool(tool, None)
            .with_latency(50)
    }

    #[tokio::test]
    async fn record_and_query_recent() {
        let store = memory_store();
        let now = Utc::now();
        for (i, q) in ["first", "second", "third"].iter().enumerate() {
            let exp = success(q, "calculator", Intent::Calculation, 10)
                .with_timestamp(now - Duration::minutes(10 - i as i64));
            store.record(&exp).await.unwrap();
        }

        let recent = store.query(&ExperienceQuery::recent(2)).await.unwrap();
        let queries: Vec<_> = recent.iter().map(|e| e.query.as_str()).collect();
        assert_eq!(queries, ["third", "second"]);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failures_filter() {
        let store = memory_store();
        store.record(&success("2+2", "calculator", Intent::Calculation, 10)).await.unwrap();
        store
            .record(&failure("1/0", "calculator", Intent::Calculation, "division by zero"))
            .await
            .unwrap();

        let failures = store.get_all_failures(10).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert!(!failures[0].success);
        assert_eq!(failures[0].error, "division by zero");
    }

    #[tokio::test]
    async fn similarity_query_respects_threshold() {
        let store = memory_store();
        store
            .record(&success("convert 10 miles to kilometers", "calculator", Intent::Calculation, 10))
            .await
            .unwrap();
        store
            .record(&success("latest news about rust", "web_search", Intent::InformationRetrieval, 10))
            .await
            .unwrap();

        let hits = store
            .query(&ExperienceQuery::similar_to("convert 10 miles to kilometers", 0.9, 10))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tool_called.as_deref(), Some("calculator"));
    }

    #[tokio::test]
    async fn intent_and_tool_filters() {
        let store = memory_store();
        store.record(&success("a", "calculator", Intent::Calculation, 10)).await.unwrap();
        store.record(&success("b", "web_search", Intent::Calculation, 10)).await.unwrap();
        store.record(&success("c", "calculator", Intent::General, 10)).await.unwrap();

        let hits = store
            .query(&ExperienceQuery::recent(10).with_intent(Intent::Calculation).with_tool("calculator"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].query, "a");
    }

    #[tokio::test]
    async fn disabled_store_reports_unavailable() {
        let store = ExperienceStore::disabled();
        assert!(!store.is_available());
        let err = store
            .record(&success("q", "calculator", Intent::Calculation, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, LearningError::StoreUnavailable(_)));
        assert!(store.query(&ExperienceQuery::recent(5)).await.unwrap().is_empty());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recorded_failures_always_carry_error_text() {
        let store = memory_store();
        let mut exp = failure("q", "calculator", Intent::Calculation, "boom");
        exp.error.clear();
        store.record(&exp).await.unwrap();

        let stored = store.get_all_failures(1).await.unwrap();
        assert_eq!(stored[0].error, UNKNOWN_ERROR);
    }
}
