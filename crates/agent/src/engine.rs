//! Shared plumbing for every reasoning strategy.
//!
//! The [`Engine`] owns the collaborators (provider, tool registry, event
//! bus) and knows how to make one model call and how to execute a batch of
//! tool calls. Every await goes through [`TurnContext::guard`], so a
//! cancelled call stops at the next external boundary. When the turn is
//! streaming, the same code paths also emit [`AgentStreamEvent`]s, which is
//! what keeps streaming and non-streaming calls in lockstep.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use kestrel_config::AgentConfig;
use kestrel_core::error::{Error, Result};
use kestrel_core::event::{DomainEvent, EventBus};
use kestrel_core::message::{Message, MessageToolCall};
use kestrel_core::provider::{Provider, ProviderRequest};
use kestrel_core::tool::{ToolCall, ToolRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::WorkingMemory;
use crate::stream_event::AgentStreamEvent;

/// Per-call state threaded through every strategy.
pub struct TurnContext {
    conversation_id: String,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<AgentStreamEvent>>,
}

impl TurnContext {
    pub fn new(conversation_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            cancel,
            events: None,
        }
    }

    /// Stream progress events to `tx` while the call runs.
    pub fn with_events(mut self, tx: mpsc::Sender<AgentStreamEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn is_streaming(&self) -> bool {
        self.events.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Send a stream event. A receiver that went away is ignored.
    pub async fn emit(&self, event: AgentStreamEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Race `fut` against the cancellation token.
    pub async fn guard<T>(&self, fut: impl Future<Output = T>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            out = fut => Ok(out),
        }
    }
}

/// Model and sampling options shared by every request.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub model: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl From<&AgentConfig> for EngineSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

pub struct Engine {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    event_bus: Arc<EventBus>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        event_bus: Arc<EventBus>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            provider,
            tools,
            event_bus,
            settings,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn has_tools(&self) -> bool {
        !self.tools.is_empty()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Build a request over `messages`. `instructions` are appended to the
    /// configured system prompt.
    pub fn request(
        &self,
        instructions: Option<&str>,
        messages: Vec<Message>,
        with_tools: bool,
    ) -> ProviderRequest {
        let system: Vec<&str> = [Some(self.settings.system_prompt.as_str()), instructions]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        let mut request = ProviderRequest::new(&self.settings.model, messages)
            .with_sampling(self.settings.temperature, self.settings.max_tokens);
        if !system.is_empty() {
            request = request.with_system_prompt(system.join("\n\n"));
        }
        if with_tools && self.has_tools() {
            request = request.with_tools(self.tools.definitions());
        }
        request
    }

    /// One model call. With `forward_chunks` on a streaming turn the reply
    /// is streamed and every text delta is emitted as a chunk event;
    /// otherwise the provider's complete endpoint is used.
    pub async fn call(
        &self,
        mut request: ProviderRequest,
        turn: &TurnContext,
        forward_chunks: bool,
    ) -> Result<Message> {
        if !(forward_chunks && turn.is_streaming()) {
            let response = turn.guard(self.provider.complete(request)).await??;
            return Ok(response.message);
        }

        request.stream = true;
        let mut rx = turn.guard(self.provider.stream(request)).await??;

        let mut content = String::new();
        let mut tool_calls: Vec<MessageToolCall> = Vec::new();

        while let Some(chunk) = turn.guard(rx.recv()).await? {
            let chunk = chunk?;

            if let Some(text) = chunk.content
                && !text.is_empty()
            {
                content.push_str(&text);
                turn.emit(AgentStreamEvent::Chunk { content: text }).await;
            }

            // Tool call deltas arrive split across chunks; merge by id
            for delta in chunk.tool_calls {
                if let Some(existing) = tool_calls.iter_mut().find(|t| t.id == delta.id) {
                    existing.arguments.push_str(&delta.arguments);
                } else {
                    tool_calls.push(delta);
                }
            }

            if chunk.done {
                break;
            }
        }

        let mut message = Message::assistant(content);
        message.tool_calls = tool_calls;
        Ok(message)
    }

    /// Execute tool calls strictly in request order.
    ///
    /// A failing tool becomes an `Error: ...` tool-result turn; the only
    /// error returned is cancellation.
    pub async fn execute_tools(
        &self,
        calls: &[MessageToolCall],
        turn: &TurnContext,
        wm: &mut WorkingMemory,
    ) -> Result<Vec<Message>> {
        let mut results = Vec::with_capacity(calls.len());

        for tc in calls {
            wm.add_action(&format!("{}({})", tc.name, tc.arguments));

            let input = serde_json::from_str(&tc.arguments)
                .unwrap_or_else(|_| serde_json::Value::String(tc.arguments.clone()));
            turn.emit(AgentStreamEvent::ToolCall {
                id: tc.id.clone(),
                name: tc.name.clone(),
                input,
            })
            .await;

            let start = Instant::now();
            let outcome = match ToolCall::from_message(tc) {
                Ok(call) => turn.guard(self.tools.execute(&call)).await?,
                Err(e) => Err(e),
            };
            let duration_ms = start.elapsed().as_millis() as u64;

            let (output, success) = match outcome {
                Ok(result) => {
                    debug!(tool = %tc.name, duration_ms, "Tool executed");
                    (result.output, true)
                }
                Err(e) => {
                    warn!(tool = %tc.name, error = %e, "Tool execution failed");
                    (format!("Error: {e}"), false)
                }
            };

            self.event_bus.publish(DomainEvent::ToolExecuted {
                tool_name: tc.name.clone(),
                success,
                duration_ms,
                timestamp: Utc::now(),
            });

            wm.add_observation(&output);
            wm.add_tool_result(&tc.name, &tc.arguments, &output, success, duration_ms);

            turn.emit(AgentStreamEvent::ToolResult {
                id: tc.id.clone(),
                name: tc.name.clone(),
                output: output.clone(),
                success,
            })
            .await;

            results.push(Message::tool_result(&tc.id, output));
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::test_helpers::*;
    use kestrel_core::provider::{ProviderResponse, StreamChunk};
    use kestrel_core::error::ProviderError;

    fn engine(provider: Arc<dyn Provider>) -> Engine {
        Engine::new(
            provider,
            calculator_registry(),
            Arc::new(EventBus::default()),
            EngineSettings::default(),
        )
    }

    #[test]
    fn request_joins_system_prompt_and_instructions() {
        let engine = engine(Arc::new(SequentialMockProvider::new(vec![])));
        let req = engine.request(Some("Think first."), vec![Message::user("hi")], true);
        let system = req.system_prompt.unwrap();
        assert!(system.starts_with("You are a helpful assistant"));
        assert!(system.ends_with("Think first."));
        assert_eq!(req.tools.len(), 1);

        let bare = engine.request(None, vec![], false);
        assert!(bare.tools.is_empty());
    }

    #[tokio::test]
    async fn failing_tool_becomes_error_turn() {
        let engine = engine(Arc::new(SequentialMockProvider::new(vec![])));
        let mut rx = engine.event_bus().subscribe();
        let turn = TurnContext::new("c1", CancellationToken::new());
        let mut wm = WorkingMemory::default();

        let calls = vec![
            make_tool_call("calculator", serde_json::json!({"expression": "1 / 0"})),
            make_tool_call("missing_tool", serde_json::json!({})),
        ];
        let results = engine.execute_tools(&calls, &turn, &mut wm).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].content.contains("division by zero"));
        assert_eq!(results[0].tool_call_id.as_deref(), Some("call_calculator"));
        assert!(results[1].content.contains("Tool not found"));
        assert!(wm.tool_results.iter().all(|r| !r.success));

        let event = rx.recv().await.unwrap();
        assert!(matches!(event.as_ref(), DomainEvent::ToolExecuted { success: false, .. }));
    }

    #[tokio::test]
    async fn cancelled_turn_stops_before_the_call() {
        let engine = engine(Arc::new(PendingProvider));
        let token = CancellationToken::new();
        let turn = TurnContext::new("c1", token.clone());
        token.cancel();

        let err = engine
            .call(engine.request(None, vec![Message::user("hi")], false), &turn, false)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    struct ChunkedProvider;

    #[async_trait::async_trait]
    impl Provider for ChunkedProvider {
        fn name(&self) -> &str {
            "chunked"
        }

        async fn complete(&self, _request: ProviderRequest) -> std::result::Result<ProviderResponse, ProviderError> {
            Err(ProviderError::NotConfigured("stream only".into()))
        }

        async fn stream(
            &self,
            _request: ProviderRequest,
        ) -> std::result::Result<
            mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>,
            ProviderError,
        > {
            let (tx, rx) = mpsc::channel(8);
            let call = |args: &str| MessageToolCall {
                id: "call_1".into(),
                name: "calculator".into(),
                arguments: args.into(),
            };
            let chunks = vec![
                StreamChunk { content: Some("Let me ".into()), tool_calls: vec![], done: false, usage: None },
                StreamChunk { content: Some("compute.".into()), tool_calls: vec![call(r#"{"expression":"#)], done: false, usage: None },
                StreamChunk { content: None, tool_calls: vec![call(r#""2 + 2"}"#)], done: true, usage: None },
            ];
            for chunk in chunks {
                tx.send(Ok(chunk)).await.unwrap();
            }
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn streamed_reply_merges_deltas_and_forwards_chunks() {
        let engine = engine(Arc::new(ChunkedProvider));
        let (tx, mut rx) = mpsc::channel(16);
        let turn = TurnContext::new("c1", CancellationToken::new()).with_events(tx);

        let reply = engine
            .call(engine.request(None, vec![Message::user("2+2")], true), &turn, true)
            .await
            .unwrap();
        drop(turn);

        assert_eq!(reply.content, "Let me compute.");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].arguments, r#"{"expression":"2 + 2"}"#);

        let mut chunks = Vec::new();
        while let Some(event) = rx.recv().await {
            if let AgentStreamEvent::Chunk { content } = event {
                chunks.push(content);
            }
        }
        assert_eq!(chunks, vec!["Let me ", "compute."]);
    }
}
