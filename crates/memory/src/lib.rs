//! Memory system implementations for Kestrel.
//!
//! - [`RecencyBuffer`]: the bounded recency tier
//! - [`SemanticIndex`]: embed + store + recency-boosted search, shared with
//!   the experience store
//! - [`DualTierMemory`]: both tiers behind the `ConversationMemory` contract
//! - [`InMemoryVectorStore`] / [`SqliteVectorStore`]: vector stores
//! - [`HashingEmbedder`]: deterministic offline embedder

pub mod dual;
pub mod embedding;
pub mod in_memory;
pub mod recency;
pub mod semantic;
pub mod vector;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use dual::{DualTierMemory, TURNS_COLLECTION};
pub use embedding::{tokenize, HashingEmbedder};
pub use in_memory::InMemoryVectorStore;
pub use recency::RecencyBuffer;
pub use semantic::{payload_timestamp, RankedHit, RecencyBoost, SemanticIndex};
pub use vector::{cosine_similarity, rank_records};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteVectorStore;

use kestrel_config::MemoryConfig;
use kestrel_core::error::MemoryError;
use kestrel_core::vector::VectorStore;
use std::sync::Arc;

/// Open the vector store named by the configuration: SQLite when a path is
/// set, otherwise a process-local store.
pub async fn open_vector_store(config: &MemoryConfig) -> Result<Arc<dyn VectorStore>, MemoryError> {
    match &config.sqlite_path {
        #[cfg(feature = "sqlite")]
        Some(path) => Ok(Arc::new(SqliteVectorStore::new(path).await?)),
        #[cfg(not(feature = "sqlite"))]
        Some(path) => Err(MemoryError::Storage(format!(
            "sqlite_path '{path}' set but the sqlite feature is disabled"
        ))),
        None => Ok(Arc::new(InMemoryVectorStore::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_config_opens_in_memory_store() {
        let store = open_vector_store(&MemoryConfig::default()).await.unwrap();
        assert_eq!(store.name(), "in_memory");
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn sqlite_path_opens_sqlite_store() {
        let config = MemoryConfig {
            sqlite_path: Some("sqlite::memory:".into()),
            ..MemoryConfig::default()
        };
        let store = open_vector_store(&config).await.unwrap();
        assert_eq!(store.name(), "sqlite");
    }
}
