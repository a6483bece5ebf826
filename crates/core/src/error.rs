//! Error types for the Kestrel domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`Error`] wraps them and adds
//! the orchestration-level failures of the conversation loop.

use thiserror::Error;

/// The top-level error type for all Kestrel operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Learning subsystem errors ---
    #[error("Learning error: {0}")]
    Learning(#[from] LearningError),

    // --- Orchestration errors ---
    #[error("Max iterations reached ({max}) without a final answer")]
    IterationLimit { max: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Reasoning strategy failed: {0}")]
    Strategy(String),

    #[error("Reflection failed: {0}")]
    Reflection(String),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error came from the cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether the error is the "max iterations reached" signal.
    pub fn is_iteration_limit(&self) -> bool {
        matches!(self, Error::IterationLimit { .. })
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

/// Failures of the experiential learning subsystem.
///
/// These never escape `chat`; the agent logs them and keeps answering.
#[derive(Debug, Clone, Error)]
pub enum LearningError {
    #[error("Experience store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Experience store operation failed: {0}")]
    Store(#[from] MemoryError),

    #[error("Experience recorder is shut down")]
    RecorderClosed,

    #[error("Experience recorder needs a Tokio runtime: {0}")]
    NoRuntime(String),
}
