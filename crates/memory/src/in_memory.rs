//! In-memory vector store: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use kestrel_core::error::MemoryError;
use kestrel_core::vector::{PayloadFilter, ScoredRecord, VectorRecord, VectorStore};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::vector::rank_records;

#[derive(Default)]
struct Collection {
    dimensions: usize,
    /// Insertion order is kept so `scroll` is stable
    points: Vec<VectorRecord>,
}

/// A vector store that keeps every collection in a process-local map.
/// Search is a brute-force cosine scan.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn ensure_collection(&self, collection: &str, dimensions: usize) -> Result<(), MemoryError> {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_insert_with(|| Collection {
                dimensions,
                points: Vec::new(),
            });
        Ok(())
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<(), MemoryError> {
        let mut collections = self.collections.write().await;
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| MemoryError::CollectionNotFound(collection.to_string()))?;

        for record in records {
            if record.vector.len() != coll.dimensions {
                return Err(MemoryError::Storage(format!(
                    "vector has {} dimensions, collection '{collection}' expects {}",
                    record.vector.len(),
                    coll.dimensions
                )));
            }
            match coll.points.iter_mut().find(|p| p.id == record.id) {
                Some(existing) => *existing = record,
                None => coll.points.push(record),
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredRecord>, MemoryError> {
        let collections = self.collections.read().await;
        let coll = collections
            .get(collection)
            .ok_or_else(|| MemoryError::CollectionNotFound(collection.to_string()))?;
        Ok(rank_records(&coll.points, vector, limit, score_threshold, filter))
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&PayloadFilter>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, MemoryError> {
        let collections = self.collections.read().await;
        let coll = collections
            .get(collection)
            .ok_or_else(|| MemoryError::CollectionNotFound(collection.to_string()))?;
        Ok(coll
            .points
            .iter()
            .filter(|p| filter.is_none_or(|f| f.matches(&p.payload)))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, collection: &str) -> Result<usize, MemoryError> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map_or(0, |c| c.points.len()))
    }

    async fn clear_collection(&self, collection: &str) -> Result<(), MemoryError> {
        if let Some(coll) = self.collections.write().await.get_mut(collection) {
            coll.points.clear();
        }
        Ok(())
    }
}
