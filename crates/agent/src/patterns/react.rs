//! ReAct pattern: Thought → Action → Observation loop.
//!
//! The model reasons step-by-step, choosing tools to gather information,
//! then answers. All reasoning steps are recorded in working memory and
//! are fully inspectable.
//!
//! # Trace Format
//!
//! Each iteration records:
//! - **Thought**: the model's reasoning (from the `content` field)
//! - **Action**: which tool was called with what arguments
//! - **Observation**: the tool execution result
//!
//! The loop terminates when the model returns a response with no tool
//! calls. Running out of iterations is an error: the call fails with
//! [`Error::IterationLimit`] rather than returning a partial answer.
//!
//! The same loop drives the simple strategy ([`ReactAgent::run_direct`]):
//! one model call with the tools attached, continuing only if the model
//! asks for tools.

use kestrel_core::error::{Error, Result};
use kestrel_core::message::Message;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::working_memory::{TraceEntry, WorkingMemory};
use crate::engine::{Engine, TurnContext};
use crate::stream_event::AgentStreamEvent;

/// Appended to the system prompt for the tool-use strategy.
pub const REACT_INSTRUCTIONS: &str = "Work in Thought / Action / Observation steps. \
Think about what you need, call a tool when it helps, read its result, and repeat. \
When you have enough information, reply with the final answer and no tool calls.";

pub struct ReactAgent {
    engine: Arc<Engine>,
    /// Maximum reasoning iterations.
    max_iterations: u32,
}

/// The result of a ReAct execution.
#[derive(Debug, Clone)]
pub struct ReactResult {
    /// The final answer text.
    pub answer: String,
    /// Assistant tool-call turns and their tool results, in order.
    /// The final answer is not included.
    pub transcript: Vec<Message>,
    /// Complete reasoning trace.
    pub trace: Vec<TraceEntry>,
    /// Working memory snapshot at completion.
    pub working_memory: WorkingMemory,
    /// Number of iterations used.
    pub iterations: usize,
    /// Total tool calls made.
    pub tool_calls_made: usize,
}

/// How a guided run ended.
#[derive(Debug)]
pub enum ReactAttempt {
    Answered(ReactResult),
    /// The model stopped without an answer. `partial` keeps the tool turns
    /// already made so a fallback can build on them.
    Abandoned { reason: String, partial: ReactResult },
}

impl ReactAttempt {
    fn into_result(self) -> Result<ReactResult> {
        match self {
            ReactAttempt::Answered(result) => Ok(result),
            ReactAttempt::Abandoned { reason, .. } => Err(Error::Strategy(reason)),
        }
    }
}

impl ReactAgent {
    pub fn new(engine: Arc<Engine>, max_iterations: u32) -> Self {
        Self {
            engine,
            max_iterations,
        }
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Tool-use strategy: guided Thought/Action/Observation loop.
    ///
    /// Ending without a usable answer is a strategy failure
    /// ([`Error::Strategy`]) the caller may recover from.
    pub async fn run(&self, history: &[Message], turn: &TurnContext) -> Result<ReactResult> {
        self.attempt(history, turn).await?.into_result()
    }

    /// Like [`run`](Self::run), but an answerless ending comes back with
    /// its partial transcript instead of as an error.
    pub async fn attempt(&self, history: &[Message], turn: &TurnContext) -> Result<ReactAttempt> {
        self.drive(history, turn, Some(REACT_INSTRUCTIONS)).await
    }

    /// Simple strategy: one model call, looping only on tool requests.
    pub async fn run_direct(&self, history: &[Message], turn: &TurnContext) -> Result<ReactResult> {
        self.drive(history, turn, None).await?.into_result()
    }

    async fn drive(
        &self,
        history: &[Message],
        turn: &TurnContext,
        instructions: Option<&str>,
    ) -> Result<ReactAttempt> {
        let mut wm = WorkingMemory::new(self.max_iterations as usize);
        let mut transcript: Vec<Message> = Vec::new();
        let mut total_tool_calls = 0usize;
        let guided = instructions.is_some();

        info!(
            conversation_id = %turn.conversation_id(),
            max_iter = self.max_iterations,
            guided,
            "ReAct loop starting"
        );

        loop {
            if !wm.tick() {
                warn!(
                    conversation_id = %turn.conversation_id(),
                    max_iterations = self.max_iterations,
                    tool_calls = total_tool_calls,
                    "ReAct: max iterations reached without a final answer"
                );
                return Err(Error::IterationLimit {
                    max: self.max_iterations,
                });
            }

            debug!(iteration = wm.iterations, "ReAct iteration");

            let mut messages = history.to_vec();
            messages.extend(transcript.iter().cloned());
            let request = self.engine.request(instructions, messages, true);

            let reply = self.engine.call(request, turn, true).await?;

            // ── Check for final answer ──
            if reply.tool_calls.is_empty() {
                let abandoned = guided && reply.content.trim().is_empty();
                if !reply.content.is_empty() {
                    wm.add_thought(&reply.content);
                }

                let result = ReactResult {
                    answer: reply.content,
                    transcript,
                    trace: wm.trace.clone(),
                    iterations: wm.iterations,
                    working_memory: wm,
                    tool_calls_made: total_tool_calls,
                };

                if abandoned {
                    warn!(
                        iterations = result.iterations,
                        tool_calls = total_tool_calls,
                        "ReAct loop ended without an answer"
                    );
                    return Ok(ReactAttempt::Abandoned {
                        reason: "model ended the ReAct loop without an answer".into(),
                        partial: result,
                    });
                }

                info!(
                    iterations = result.iterations,
                    tool_calls = total_tool_calls,
                    "ReAct loop completed"
                );
                return Ok(ReactAttempt::Answered(result));
            }

            // ── Record thought ──
            if !reply.content.is_empty() {
                wm.add_thought(&reply.content);
                turn.emit(AgentStreamEvent::Thought {
                    content: reply.content.clone(),
                })
                .await;
            }

            // ── Execute tool calls ──
            let results = self
                .engine
                .execute_tools(&reply.tool_calls, turn, &mut wm)
                .await?;
            total_tool_calls += results.len();
            transcript.push(reply);
            transcript.extend(results);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::working_memory::TraceKind;
    use crate::engine::EngineSettings;
    use crate::patterns::test_helpers::*;
    use kestrel_core::event::EventBus;
    use kestrel_core::message::{MessageToolCall, Role};
    use kestrel_core::provider::Provider;
    use tokio_util::sync::CancellationToken;

    fn setup(provider: Arc<dyn Provider>, max_iterations: u32) -> ReactAgent {
        let engine = Engine::new(
            provider,
            calculator_registry(),
            Arc::new(EventBus::default()),
            EngineSettings::default(),
        );
        ReactAgent::new(Arc::new(engine), max_iterations)
    }

    fn turn() -> TurnContext {
        TurnContext::new("conv-test", CancellationToken::new())
    }

    #[tokio::test]
    async fn simple_text_response() {
        let agent = setup(Arc::new(SequentialMockProvider::single_text("Final answer")), 10);

        let result = agent.run(&[Message::user("Hello")], &turn()).await.unwrap();
        assert_eq!(result.answer, "Final answer");
        assert_eq!(result.iterations, 1);
        assert_eq!(result.tool_calls_made, 0);
        assert!(result.transcript.is_empty());
    }

    #[tokio::test]
    async fn thought_action_observation_trace() {
        let tool_calls = vec![make_tool_call(
            "calculator",
            serde_json::json!({"expression": "2 + 3"}),
        )];
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            tool_calls,
            "I need to calculate 2 + 3",
            "The result is 5",
        ));
        let agent = setup(provider.clone(), 10);

        let result = agent
            .run(&[Message::user("What is 2+3?")], &turn())
            .await
            .unwrap();

        assert_eq!(result.answer, "The result is 5");
        assert_eq!(result.tool_calls_made, 1);

        // Thought → Action → Observation → Thought (final)
        assert_eq!(result.trace.len(), 4);
        assert_eq!(result.trace[0].kind, TraceKind::Thought);
        assert!(result.trace[0].content.contains("calculate"));
        assert_eq!(result.trace[1].kind, TraceKind::Action);
        assert!(result.trace[1].content.contains("calculator"));
        assert_eq!(result.trace[2].kind, TraceKind::Observation);
        assert_eq!(result.trace[2].content, "5");

        // Assistant tool-call turn followed by its result
        assert_eq!(result.transcript.len(), 2);
        assert!(result.transcript[0].has_tool_calls());
        assert_eq!(result.transcript[1].role, Role::Tool);

        // The second request carries the guided prompt and the observation
        let requests = provider.requests();
        assert!(requests[1].system_prompt.as_deref().unwrap().contains("Observation"));
        assert_eq!(requests[1].messages.last().unwrap().content, "5");
    }

    #[tokio::test]
    async fn multiple_tool_calls_run_in_order() {
        let tool_calls = vec![
            make_tool_call("calculator", serde_json::json!({"expression": "10 * 5"})),
            MessageToolCall {
                id: "call_2".into(),
                ..make_tool_call("calculator", serde_json::json!({"expression": "7 - 2"}))
            },
        ];
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            tool_calls,
            "Two calculations",
            "50 and 5",
        ));
        let agent = setup(provider, 10);

        let result = agent
            .run(&[Message::user("Calculate 10*5 and 7-2")], &turn())
            .await
            .unwrap();

        assert_eq!(result.tool_calls_made, 2);
        let outputs: Vec<_> = result
            .working_memory
            .tool_results
            .iter()
            .map(|r| r.output_summary.as_str())
            .collect();
        assert_eq!(outputs, vec!["50", "5"]);
        assert_eq!(result.transcript[1].tool_call_id.as_deref(), Some("call_calculator"));
        assert_eq!(result.transcript[2].tool_call_id.as_deref(), Some("call_2"));
    }

    #[tokio::test]
    async fn tool_error_does_not_abort_the_loop() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![make_tool_call("calculator", serde_json::json!({"expression": "1 / 0"}))],
            "Dividing",
            "You cannot divide by zero",
        ));
        let agent = setup(provider.clone(), 10);

        let result = agent
            .run(&[Message::user("calculate 1/0")], &turn())
            .await
            .unwrap();

        assert_eq!(result.answer, "You cannot divide by zero");
        assert!(!result.working_memory.tool_results[0].success);

        let observed = &provider.requests()[1].messages;
        let tool_turn = observed.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_turn.content.starts_with("Error:"));
        assert!(tool_turn.content.contains("division by zero"));
    }

    #[tokio::test]
    async fn max_iterations_is_an_error() {
        let responses: Vec<_> = (0..5)
            .map(|_| {
                make_tool_call_response(
                    vec![make_tool_call("calculator", serde_json::json!({"expression": "1+1"}))],
                    "Thinking...",
                )
            })
            .collect();
        let provider = Arc::new(SequentialMockProvider::new(responses));
        let agent = setup(provider.clone(), 3);

        let err = agent
            .run(&[Message::user("Infinite loop")], &turn())
            .await
            .unwrap_err();

        assert!(err.is_iteration_limit());
        assert!(err.to_string().contains("Max iterations reached (3)"));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn guided_empty_answer_is_a_strategy_failure() {
        let agent = setup(Arc::new(SequentialMockProvider::single_text("  ")), 10);
        let err = agent.run(&[Message::user("hi")], &turn()).await.unwrap_err();
        assert!(matches!(err, Error::Strategy(_)));

        let agent = setup(Arc::new(SequentialMockProvider::single_text("")), 10);
        let direct = agent.run_direct(&[Message::user("hi")], &turn()).await.unwrap();
        assert_eq!(direct.answer, "");
    }

    #[tokio::test]
    async fn abandoned_attempt_keeps_its_tool_turns() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(
                vec![make_tool_call("calculator", serde_json::json!({"expression": "6*7"}))],
                "Computing",
            ),
            make_text_response(""),
        ]));
        let agent = setup(provider, 10);

        match agent.attempt(&[Message::user("6 times 7?")], &turn()).await.unwrap() {
            ReactAttempt::Abandoned { reason, partial } => {
                assert!(reason.contains("without an answer"));
                assert_eq!(partial.tool_calls_made, 1);
                let roles: Vec<_> = partial.transcript.iter().map(|m| m.role).collect();
                assert_eq!(roles, vec![Role::Assistant, Role::Tool]);
                assert!(partial.transcript[1].content.contains("42"));
            }
            other => panic!("expected an abandoned attempt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn direct_run_has_no_react_instructions() {
        let provider = Arc::new(SequentialMockProvider::single_text("Hi there"));
        let agent = setup(provider.clone(), 10);

        agent.run_direct(&[Message::user("Hello")], &turn()).await.unwrap();
        let request = &provider.requests()[0];
        assert!(!request.system_prompt.as_deref().unwrap().contains("Observation"));
        assert_eq!(request.tools.len(), 1);
    }

    #[tokio::test]
    async fn provider_error_propagates() {
        let agent = setup(Arc::new(SequentialMockProvider::new(vec![])), 10);
        let err = agent.run(&[Message::user("hi")], &turn()).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }
}
