//! # Kestrel Core
//!
//! Domain types, collaborator traits, and error definitions for the Kestrel
//! agent. This crate has **no framework dependencies**; it defines the model
//! that the memory, learning, and agent crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (LLM provider, tool, embedder, vector store,
//! conversation memory) is a trait here. Implementations live elsewhere,
//! which keeps the dependency graph pointing inward and makes every piece
//! replaceable by a scripted stub in tests.

pub mod error;
pub mod event;
pub mod experience;
pub mod memory;
pub mod message;
pub mod provider;
pub mod tool;
pub mod vector;

// Re-export key types at crate root for ergonomics
pub use error::{Error, LearningError, MemoryError, ProviderError, Result, ToolError};
pub use event::{DomainEvent, EventBus};
pub use experience::{Experience, Intent, ReasoningMode};
pub use memory::{ConversationMemory, ScoredTurn, SemanticSearch};
pub use message::{ConversationId, Message, MessageToolCall, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition, Usage};
pub use tool::{Tool, ToolCall, ToolRegistry, ToolResult};
pub use vector::{Embedder, PayloadFilter, ScoredRecord, VectorRecord, VectorStore};
