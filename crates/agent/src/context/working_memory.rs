//! Working memory: in-process scratchpad for a single call.
//!
//! Stores the reasoning trace (Thought/Action/Observation/Reflection) and
//! the tool executions of one `chat` call. Working memory is:
//!
//! - **Call-scoped**: created per strategy run, never persisted
//! - **Serializable**: can be exported to JSON for debugging
//! - **Queryable**: the agent reads tool outcomes from it when it records
//!   the call as an experience

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Data Structures ───────────────────────────────────────────────────────

/// The agent's scratchpad within a single call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemory {
    /// Reasoning trace entries.
    pub trace: Vec<TraceEntry>,

    /// Recorded tool execution results, in execution order.
    pub tool_results: Vec<ToolResultEntry>,

    /// Current iteration counter.
    pub iterations: usize,

    /// Maximum iterations allowed.
    pub max_iterations: usize,
}

/// A single entry in the reasoning trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub kind: TraceKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// The kind of reasoning trace entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TraceKind {
    Thought,
    Action,
    Observation,
    Reflection,
}

/// A recorded tool execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultEntry {
    pub tool_name: String,
    pub input_summary: String,
    pub output_summary: String,
    pub success: bool,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

// ── Implementation ────────────────────────────────────────────────────────

impl WorkingMemory {
    /// Create a new empty working memory.
    pub fn new(max_iterations: usize) -> Self {
        Self {
            trace: Vec::new(),
            tool_results: Vec::new(),
            iterations: 0,
            max_iterations,
        }
    }

    // ── Trace recording ──

    pub fn add_thought(&mut self, thought: &str) {
        self.push_trace(TraceKind::Thought, thought);
    }

    pub fn add_action(&mut self, action: &str) {
        self.push_trace(TraceKind::Action, action);
    }

    pub fn add_observation(&mut self, observation: &str) {
        self.push_trace(TraceKind::Observation, observation);
    }

    pub fn add_reflection(&mut self, reflection: &str) {
        self.push_trace(TraceKind::Reflection, reflection);
    }

    fn push_trace(&mut self, kind: TraceKind, content: &str) {
        self.trace.push(TraceEntry {
            kind,
            content: content.to_string(),
            timestamp: Utc::now(),
        });
    }

    // ── Tool results ──

    /// Record a tool execution result.
    pub fn add_tool_result(
        &mut self,
        tool_name: &str,
        input: &str,
        output: &str,
        success: bool,
        duration_ms: u64,
    ) {
        self.tool_results.push(ToolResultEntry {
            tool_name: tool_name.to_string(),
            input_summary: input.to_string(),
            output_summary: output.to_string(),
            success,
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    /// The most recent execution of `tool_name`.
    pub fn last_result_for(&self, tool_name: &str) -> Option<&ToolResultEntry> {
        self.tool_results.iter().rev().find(|r| r.tool_name == tool_name)
    }

    /// Total time spent inside tools.
    pub fn tool_time_ms(&self) -> u64 {
        self.tool_results.iter().map(|r| r.duration_ms).sum()
    }

    /// Fold another scratchpad's trace and tool results into this one.
    pub fn absorb(&mut self, other: WorkingMemory) {
        self.trace.extend(other.trace);
        self.tool_results.extend(other.tool_results);
        self.iterations += other.iterations;
    }

    // ── Iteration tracking ──

    /// Increment the iteration counter. Returns `false` if max exceeded.
    pub fn tick(&mut self) -> bool {
        self.iterations += 1;
        self.iterations <= self.max_iterations
    }

    /// Brief summary for logs.
    pub fn summarize(&self) -> String {
        let mut parts = Vec::new();

        if !self.tool_results.is_empty() {
            let success = self.tool_results.iter().filter(|t| t.success).count();
            parts.push(format!(
                "{} tool calls ({} successful)",
                self.tool_results.len(),
                success
            ));
        }

        parts.push(format!("{} iterations used", self.iterations));

        parts.join(". ")
    }

    pub fn is_empty(&self) -> bool {
        self.trace.is_empty() && self.tool_results.is_empty()
    }
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new(10)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
