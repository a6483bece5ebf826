//! Shared test helpers for agent tests.

use async_trait::async_trait;
use kestrel_core::error::{ProviderError, ToolError};
use kestrel_core::message::{Message, MessageToolCall};
use kestrel_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use kestrel_core::tool::{Tool, ToolRegistry, ToolResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A mock provider that returns a sequence of scripted responses.
///
/// Each call to `complete` returns the next response in the queue and
/// records the request. Once the script is exhausted it fails with a
/// provider error.
pub struct SequentialMockProvider {
    responses: Mutex<VecDeque<ProviderResponse>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create a provider that returns a single text response (no tool calls).
    pub fn single_text(text: &str) -> Self {
        Self::new(vec![make_text_response(text)])
    }

    /// Create a provider that first returns tool calls, then a final answer.
    pub fn tool_then_answer(tool_calls: Vec<MessageToolCall>, thought: &str, answer: &str) -> Self {
        Self::new(vec![
            make_tool_call_response(tool_calls, thought),
            make_text_response(answer),
        ])
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request);
        let call = requests.len();
        drop(requests);

        self.responses.lock().unwrap().pop_front().ok_or_else(|| ProviderError::ApiError {
            status_code: 500,
            message: format!("SequentialMockProvider: no response scripted for call #{call}"),
        })
    }
}

/// A provider that never answers.
pub struct PendingProvider;

#[async_trait]
impl Provider for PendingProvider {
    fn name(&self) -> &str {
        "pending"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        std::future::pending().await
    }
}

/// Create a simple text response (no tool calls).
pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
        metadata: serde_json::Map::new(),
    }
}

/// Create a response with tool calls and optional thought content.
pub fn make_tool_call_response(tool_calls: Vec<MessageToolCall>, thought: &str) -> ProviderResponse {
    let mut response = make_text_response(thought);
    response.message.tool_calls = tool_calls;
    response
}

/// Helper to create a tool call.
pub fn make_tool_call(name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments: serde_json::to_string(&args).unwrap(),
    }
}

/// Evaluates `a <op> b` for `+ - * /`.
pub struct CalculatorTool;

impl CalculatorTool {
    fn evaluate(expression: &str) -> Result<f64, String> {
        let expr = expression.trim();
        let (pos, op) = expr
            .char_indices()
            .skip(1)
            .find(|(_, c)| matches!(c, '+' | '-' | '*' | '/'))
            .ok_or_else(|| format!("unsupported expression: {expr}"))?;
        let lhs: f64 = expr[..pos].trim().parse().map_err(|_| format!("bad operand in {expr}"))?;
        let rhs: f64 = expr[pos + 1..].trim().parse().map_err(|_| format!("bad operand in {expr}"))?;
        match op {
            '+' => Ok(lhs + rhs),
            '-' => Ok(lhs - rhs),
            '*' => Ok(lhs * rhs),
            _ if rhs == 0.0 => Err("division by zero".into()),
            _ => Ok(lhs / rhs),
        }
    }
}

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate a binary arithmetic expression"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "expression": { "type": "string" } },
            "required": ["expression"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let expression = arguments["expression"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("expression is required".into()))?;
        Ok(match Self::evaluate(expression) {
            Ok(value) if value.fract() == 0.0 => ToolResult::ok("calculator", format!("{}", value as i64)),
            Ok(value) => ToolResult::ok("calculator", value.to_string()),
            Err(reason) => ToolResult::failed("calculator", reason),
        })
    }
}

pub fn calculator_registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(CalculatorTool));
    Arc::new(registry)
}
