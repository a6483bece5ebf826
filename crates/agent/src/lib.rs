//! The conversation loop, the heart of Kestrel.
//!
//! Every message goes through the same cycle:
//!
//! 1. **Route** the query to a reasoning strategy and detect its intent
//! 2. **Build context** from recent turns and semantic recall
//! 3. **Reason** with the chosen strategy: a direct answer, a ReAct tool
//!    loop, or a chain of thought, falling back to the direct answer when a
//!    strategy fails
//! 4. **Reflect** on the provisional answer and correct it when confidence
//!    is low
//! 5. **Remember** the new turns and record the outcome as an experience
//!
//! Streaming runs the same cycle and reports progress as
//! [`AgentStreamEvent`]s.

pub mod context;
pub mod engine;
pub mod loop_runner;
pub mod patterns;
pub mod router;
pub mod stream_event;

pub use context::WorkingMemory;
pub use engine::{Engine, EngineSettings, TurnContext};
pub use loop_runner::{Agent, DEFAULT_CONFIDENCE};
pub use patterns::{ChainOfThought, CotResult, ReactAgent, ReactAttempt, ReactResult, ReflectionOutcome, Reflector};
pub use router::{HeuristicClassifier, QueryClassifier};
pub use stream_event::AgentStreamEvent;
