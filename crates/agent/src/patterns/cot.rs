//! Chain-of-thought: bounded LLM-only reasoning.
//!
//! The model is asked to reason one step per reply and to finish with a
//! `Final Answer:` line. No tools are attached. Each intermediate step is
//! fed back as an assistant turn followed by a short continue prompt.

use kestrel_core::error::{Error, Result};
use kestrel_core::message::Message;
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::WorkingMemory;
use crate::engine::{Engine, TurnContext};
use crate::stream_event::AgentStreamEvent;

pub const FINAL_ANSWER_MARKER: &str = "final answer:";

pub const COT_INSTRUCTIONS: &str = "Reason step by step. Give one reasoning step per reply. \
When you are done, write the last step followed by a line starting with 'Final Answer:' and the answer.";

const CONTINUE_PROMPT: &str = "Continue with the next step.";

pub struct ChainOfThought {
    engine: Arc<Engine>,
    max_steps: u32,
}

#[derive(Debug, Clone)]
pub struct CotResult {
    pub answer: String,
    /// Reasoning text of every step, including the concluding one.
    pub steps: Vec<String>,
    pub working_memory: WorkingMemory,
}

impl ChainOfThought {
    pub fn new(engine: Arc<Engine>, max_steps: u32) -> Self {
        Self { engine, max_steps }
    }

    pub async fn run(&self, history: &[Message], turn: &TurnContext) -> Result<CotResult> {
        let mut wm = WorkingMemory::new(self.max_steps as usize);
        let mut scratch: Vec<Message> = Vec::new();
        let mut steps = Vec::new();

        while wm.tick() {
            let mut messages = history.to_vec();
            messages.extend(scratch.iter().cloned());
            let request = self.engine.request(Some(COT_INSTRUCTIONS), messages, false);

            let reply = self.engine.call(request, turn, false).await?;
            let text = reply.content.trim();
            if text.is_empty() {
                return Err(Error::Strategy(format!(
                    "empty reasoning step {}",
                    wm.iterations
                )));
            }

            debug!(step = wm.iterations, "Chain-of-thought step");
            wm.add_thought(text);
            steps.push(text.to_string());
            turn.emit(AgentStreamEvent::Thought {
                content: text.to_string(),
            })
            .await;

            if let Some(answer) = extract_final_answer(text) {
                info!(steps = steps.len(), "Chain-of-thought concluded");
                return Ok(CotResult {
                    answer,
                    steps,
                    working_memory: wm,
                });
            }

            scratch.push(Message::assistant(text));
            scratch.push(Message::user(CONTINUE_PROMPT));
        }

        Err(Error::Strategy(format!(
            "no final answer after {} reasoning steps",
            self.max_steps
        )))
    }
}

/// Text after the last `Final Answer:` marker, matched case-insensitively.
pub fn extract_final_answer(text: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets aligned with `text`
    let lowered = text.to_ascii_lowercase();
    let pos = lowered.rfind(FINAL_ANSWER_MARKER)?;
    let answer = text[pos + FINAL_ANSWER_MARKER.len()..].trim();
    (!answer.is_empty()).then(|| answer.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::patterns::test_helpers::*;
    use kestrel_core::event::EventBus;
    use kestrel_core::message::Role;
    use tokio_util::sync::CancellationToken;

    fn setup(provider: Arc<SequentialMockProvider>, max_steps: u32) -> ChainOfThought {
        let engine = Engine::new(
            provider,
            calculator_registry(),
            Arc::new(EventBus::default()),
            EngineSettings::default(),
        );
        ChainOfThought::new(Arc::new(engine), max_steps)
    }

    fn turn() -> TurnContext {
        TurnContext::new("conv-test", CancellationToken::new())
    }

    #[test]
    fn final_answer_extraction() {
        assert_eq!(
            extract_final_answer("Blue light scatters more.\nFinal Answer: Rayleigh scattering").as_deref(),
            Some("Rayleigh scattering")
        );
        assert_eq!(extract_final_answer("FINAL ANSWER: 42").as_deref(), Some("42"));
        assert!(extract_final_answer("Still thinking").is_none());
        assert!(extract_final_answer("Final answer:   ").is_none());
    }

    #[tokio::test]
    async fn multi_step_reasoning_without_tools() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_text_response("Sunlight contains all colours."),
            make_text_response("Short wavelengths scatter more.\nFinal Answer: Rayleigh scattering"),
        ]));
        let cot = setup(provider.clone(), 5);

        let result = cot
            .run(&[Message::user("Why is the sky blue?")], &turn())
            .await
            .unwrap();

        assert_eq!(result.answer, "Rayleigh scattering");
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.working_memory.iterations, 2);

        let requests = provider.requests();
        assert!(requests.iter().all(|r| r.tools.is_empty()));
        let second = &requests[1].messages;
        assert_eq!(second[1].role, Role::Assistant);
        assert_eq!(second[2].content, CONTINUE_PROMPT);
    }

    #[tokio::test]
    async fn running_out_of_steps_is_a_strategy_failure() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_text_response("step one"),
            make_text_response("step two"),
        ]));
        let cot = setup(provider, 2);

        let err = cot.run(&[Message::user("prove it")], &turn()).await.unwrap_err();
        assert!(matches!(err, Error::Strategy(ref m) if m.contains("2 reasoning steps")));
    }

    #[tokio::test]
    async fn empty_step_is_a_strategy_failure() {
        let cot = setup(Arc::new(SequentialMockProvider::single_text("")), 3);
        let err = cot.run(&[Message::user("derive")], &turn()).await.unwrap_err();
        assert!(matches!(err, Error::Strategy(_)));
    }
}
