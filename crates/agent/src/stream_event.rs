//! Agent-level streaming events.
//!
//! `AgentStreamEvent` wraps provider-level stream chunks and loop progress
//! into higher-level events a caller can forward to its own clients.

use serde::{Deserialize, Serialize};

/// Events emitted by the agent during a streaming call.
///
/// - `chunk`: partial text token from the LLM
/// - `tool_call`: agent is invoking a tool
/// - `tool_result`: tool execution completed
/// - `thought`: reasoning step
/// - `correction`: reflection replaced the provisional answer
/// - `done`: stream is complete
/// - `error`: the call failed; no `done` follows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    /// Partial text token from the LLM.
    Chunk { content: String },

    /// The agent is calling a tool.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Tool execution completed.
    ToolResult {
        id: String,
        name: String,
        output: String,
        success: bool,
    },

    /// A reasoning step (ReAct thought or chain-of-thought step).
    Thought { content: String },

    /// The provisional answer was replaced after verification.
    Correction {
        original: String,
        corrected: String,
        confidence: f64,
    },

    /// The stream is complete: final metadata.
    Done {
        conversation_id: String,
        iterations: usize,
        tool_calls_made: usize,
        strategy: String,
    },

    /// An error occurred mid-stream.
    Error { message: String },
}

impl AgentStreamEvent {
    /// Event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Thought { .. } => "thought",
            Self::Correction { .. } => "correction",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Whether no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
