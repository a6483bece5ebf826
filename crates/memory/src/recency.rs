//! The recency tier: a fixed-capacity FIFO of conversation turns.

use async_trait::async_trait;
use kestrel_core::error::MemoryError;
use kestrel_core::memory::ConversationMemory;
use kestrel_core::message::Message;
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// Bounded, ordered turn buffer.
///
/// Once `capacity` is reached each new turn evicts the oldest one. All access
/// goes through a reader/writer lock so concurrent `add` and `history` calls
/// never observe a half-applied eviction.
pub struct RecencyBuffer {
    capacity: usize,
    turns: RwLock<VecDeque<Message>>,
}

impl RecencyBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            turns: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn push(&self, turn: Message) {
        let mut turns = self.turns.write().await;
        while turns.len() >= self.capacity {
            turns.pop_front();
        }
        turns.push_back(turn);
    }

    /// The last `limit` turns in insertion order; `0` means all.
    pub async fn last(&self, limit: usize) -> Vec<Message> {
        let turns = self.turns.read().await;
        let skip = if limit == 0 {
            0
        } else {
            turns.len().saturating_sub(limit)
        };
        turns.iter().skip(skip).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.turns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.turns.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.turns.write().await.clear();
    }
}

#[async_trait]
impl ConversationMemory for RecencyBuffer {
    fn name(&self) -> &str {
        "recency"
    }

    async fn add(&self, turn: Message) -> Result<(), MemoryError> {
        self.push(turn).await;
        Ok(())
    }

    async fn history(&self, limit: usize) -> Result<Vec<Message>, MemoryError> {
        Ok(self.last(limit).await)
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        RecencyBuffer::clear(self).await;
        Ok(())
    }
}
