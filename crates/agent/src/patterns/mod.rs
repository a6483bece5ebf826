//! Reasoning strategies.
//!
//! - **ReAct**: Thought → Action → Observation loop with visible traces;
//!   its unguided form is the simple strategy
//! - **Chain-of-thought**: bounded reasoning steps without tools
//! - **Reflection**: confidence-gated self-review of a finished answer

pub mod cot;
pub mod react;
pub mod reflection;

pub use cot::{ChainOfThought, CotResult};
pub use react::{ReactAgent, ReactAttempt, ReactResult};
pub use reflection::{ReflectionOutcome, Reflector};

#[cfg(test)]
pub(crate) mod test_helpers;
