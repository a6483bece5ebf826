//! Per-call reasoning context.

pub mod working_memory;

pub use working_memory::{ToolResultEntry, TraceEntry, TraceKind, WorkingMemory};
