//! Dual-tier conversation memory: recency buffer + semantic index.

use async_trait::async_trait;
use kestrel_config::{DEFAULT_RECALL_MIN_SIMILARITY, MemoryConfig};
use kestrel_core::error::MemoryError;
use kestrel_core::memory::{ConversationMemory, ScoredTurn, SemanticSearch};
use kestrel_core::message::{Message, Role};
use kestrel_core::vector::{Embedder, VectorStore};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use crate::recency::RecencyBuffer;
use crate::semantic::{RecencyBoost, SemanticIndex};

/// Collection holding embedded conversation turns.
pub const TURNS_COLLECTION: &str = "conversation_turns";

/// Conversation memory with an optional semantic tier.
///
/// The recency tier is authoritative for `history`. When a semantic index is
/// attached, every turn with non-empty content is also embedded; indexing
/// failures are logged and never fail the `add`.
pub struct DualTierMemory {
    recency: RecencyBuffer,
    semantic: Option<SemanticIndex>,
    /// Raw cosine floor for turns pulled into a contextual history
    recall_min_similarity: f32,
}

impl DualTierMemory {
    /// Recency tier only.
    pub fn new(capacity: usize) -> Self {
        Self {
            recency: RecencyBuffer::new(capacity),
            semantic: None,
            recall_min_similarity: DEFAULT_RECALL_MIN_SIMILARITY,
        }
    }

    pub fn with_semantic_index(mut self, index: SemanticIndex) -> Self {
        self.semantic = Some(index);
        self
    }

    pub fn with_recall_min_similarity(mut self, min_similarity: f32) -> Self {
        self.recall_min_similarity = min_similarity;
        self
    }

    /// Build from configuration. The semantic tier is attached when enabled.
    pub fn from_config(
        config: &MemoryConfig,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        let memory = Self::new(config.recency_capacity).with_recall_min_similarity(config.recall_min_similarity);
        if config.semantic_enabled {
            memory.with_semantic_index(
                SemanticIndex::new(embedder, store, TURNS_COLLECTION)
                    .with_boost(RecencyBoost::from(config)),
            )
        } else {
            memory
        }
    }

    pub fn recency(&self) -> &RecencyBuffer {
        &self.recency
    }

    fn turn_from_payload(payload: &serde_json::Map<String, serde_json::Value>) -> Option<Message> {
        serde_json::from_value(serde_json::Value::Object(payload.clone())).ok()
    }

    async fn search_above(
        &self,
        query: &str,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<ScoredTurn>, MemoryError> {
        let Some(index) = &self.semantic else {
            return Ok(Vec::new());
        };
        let hits = index.search(query, limit, min_similarity, None).await?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                Self::turn_from_payload(&hit.payload).map(|message| ScoredTurn {
                    message,
                    score: hit.score,
                    similarity: hit.similarity,
                })
            })
            .collect())
    }

    /// Turns that can stand alone in a prompt without their surrounding exchange.
    fn is_recallable(turn: &Message) -> bool {
        matches!(turn.role, Role::User | Role::Assistant) && !turn.has_tool_calls()
    }
}

#[async_trait]
impl ConversationMemory for DualTierMemory {
    fn name(&self) -> &str {
        "dual_tier"
    }

    async fn add(&self, turn: Message) -> Result<(), MemoryError> {
        if let Some(index) = &self.semantic {
            if !turn.content.trim().is_empty() {
                match serde_json::to_value(&turn) {
                    Ok(serde_json::Value::Object(payload)) => {
                        if let Err(e) = index.index(&turn.id, &turn.content, payload).await {
                            warn!(turn_id = %turn.id, error = %e, "Semantic indexing failed; turn kept in recency tier only");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(turn_id = %turn.id, error = %e, "Turn serialization failed"),
                }
            }
        }
        self.recency.push(turn).await;
        Ok(())
    }

    async fn history(&self, limit: usize) -> Result<Vec<Message>, MemoryError> {
        Ok(self.recency.last(limit).await)
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        self.recency.clear().await;
        Ok(())
    }

    fn semantic(&self) -> Option<&dyn SemanticSearch> {
        self.semantic.as_ref().map(|_| self as &dyn SemanticSearch)
    }
}

#[async_trait]
impl SemanticSearch for DualTierMemory {
    async fn search_semantic(&self, query: &str, limit: usize) -> Result<Vec<ScoredTurn>, MemoryError> {
        self.search_above(query, limit, 0.0).await
    }

    /// The recency tier is always returned in full. Semantic hits at or above
    /// the recall floor and not already present are placed before it in
    /// chronological order, so the result still ends with the latest turn.
    async fn contextual_history(
        &self,
        query: &str,
        recent_limit: usize,
        semantic_limit: usize,
    ) -> Result<Vec<Message>, MemoryError> {
        let recent = self.recency.last(recent_limit).await;
        if semantic_limit == 0 || self.semantic.is_none() {
            return Ok(recent);
        }

        let hits = match self
            .search_above(query, semantic_limit, self.recall_min_similarity)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "Semantic recall failed; using recency tier only");
                return Ok(recent);
            }
        };

        let seen: HashSet<&str> = recent.iter().map(|m| m.id.as_str()).collect();
        let mut recalled: Vec<Message> = hits
            .into_iter()
            .map(|hit| hit.message)
            .filter(|m| !seen.contains(m.id.as_str()) && Self::is_recallable(m))
            .collect();
        recalled.sort_by_key(|m| m.timestamp);

        recalled.extend(recent);
        Ok(recalled)
    }
}
