//! Conversation memory traits.
//!
//! Every memory store exposes the recency contract of [`ConversationMemory`].
//! Stores that also keep a semantic index advertise it through
//! [`ConversationMemory::semantic`], so callers discover the capability by
//! asking the trait object instead of downcasting to a concrete type.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::MemoryError;
use crate::message::Message;

/// A conversation turn returned by semantic search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredTurn {
    pub message: Message,
    /// Similarity after the recency boost was applied
    pub score: f32,
    /// Raw similarity reported by the vector store
    pub similarity: f32,
}

/// The core conversation memory contract.
#[async_trait]
pub trait ConversationMemory: Send + Sync {
    /// The backend name (e.g., "recency", "dual_tier").
    fn name(&self) -> &str;

    /// Append a turn.
    async fn add(&self, turn: Message) -> Result<(), MemoryError>;

    /// The last `limit` turns in order; `0` returns everything buffered.
    async fn history(&self, limit: usize) -> Result<Vec<Message>, MemoryError>;

    /// Drop every buffered turn.
    async fn clear(&self) -> Result<(), MemoryError>;

    /// Optional semantic-search capability.
    fn semantic(&self) -> Option<&dyn SemanticSearch> {
        None
    }
}

/// Extended capability for stores with a semantic index.
#[async_trait]
pub trait SemanticSearch: Send + Sync {
    /// Nearest turns to `query`, re-ranked by recency.
    async fn search_semantic(&self, query: &str, limit: usize) -> Result<Vec<ScoredTurn>, MemoryError>;

    /// Semantic hits for `query` in chronological order, followed by the
    /// recent turns; hits already in the recency tier are skipped.
    ///
    /// Semantic failures degrade to the recency tier alone.
    async fn contextual_history(
        &self,
        query: &str,
        recent_limit: usize,
        semantic_limit: usize,
    ) -> Result<Vec<Message>, MemoryError>;
}
