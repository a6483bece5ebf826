//! The experience record: one completed top-level agent call.
//!
//! Experiences are the unit the learning subsystem is built from. They are
//! created once, never mutated afterwards, and persisted as the payload of a
//! vector-store point keyed by the query embedding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::message::ConversationId;

/// Coarse classification of what a query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Calculation,
    InformationRetrieval,
    FileOperation,
    Datetime,
    SystemInfo,
    General,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::Calculation,
        Intent::InformationRetrieval,
        Intent::FileOperation,
        Intent::Datetime,
        Intent::SystemInfo,
        Intent::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Calculation => "calculation",
            Intent::InformationRetrieval => "information_retrieval",
            Intent::FileOperation => "file_operation",
            Intent::Datetime => "datetime",
            Intent::SystemInfo => "system_info",
            Intent::General => "general",
        }
    }

    /// Parse a snake_case intent name; unknown names map to `General`.
    pub fn parse(s: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|i| i.as_str() == s.trim())
            .unwrap_or(Intent::General)
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The reasoning strategy the router chose for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMode {
    Simple,
    ChainOfThought,
    ToolUse,
}

impl ReasoningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningMode::Simple => "simple",
            ReasoningMode::ChainOfThought => "chain_of_thought",
            ReasoningMode::ToolUse => "tool_use",
        }
    }
}

impl std::fmt::Display for ReasoningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error text used when a failure is recorded without a message.
pub const UNKNOWN_ERROR: &str = "unknown error";

/// One durable record of a completed agent interaction.
///
/// `success == false` always carries a non-empty `error`, and
/// `success == true` always carries an empty one; the constructors enforce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub query: String,
    #[serde(default)]
    pub response: String,
    pub success: bool,
    #[serde(default)]
    pub error: String,
    pub intent: Intent,
    pub reasoning_mode: ReasoningMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_called: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    pub latency_ms: u64,
    pub confidence: f64,
    #[serde(default)]
    pub was_reflected: bool,
    #[serde(default)]
    pub was_corrected: bool,
    pub conversation_id: String,
}

impl Experience {
    fn base(
        query: impl Into<String>,
        intent: Intent,
        mode: ReasoningMode,
        conversation_id: &ConversationId,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            query: query.into(),
            response: String::new(),
            success: true,
            error: String::new(),
            intent,
            reasoning_mode: mode,
            tool_called: None,
            arguments: None,
            latency_ms: 0,
            confidence: 0.0,
            was_reflected: false,
            was_corrected: false,
            conversation_id: conversation_id.to_string(),
        }
    }

    /// A successful interaction.
    pub fn succeeded(
        query: impl Into<String>,
        response: impl Into<String>,
        intent: Intent,
        mode: ReasoningMode,
        conversation_id: &ConversationId,
    ) -> Self {
        let mut exp = Self::base(query, intent, mode, conversation_id);
        exp.response = response.into();
        exp
    }

    /// A failed interaction. An empty error becomes [`UNKNOWN_ERROR`].
    pub fn failed(
        query: impl Into<String>,
        error: impl Into<String>,
        intent: Intent,
        mode: ReasoningMode,
        conversation_id: &ConversationId,
    ) -> Self {
        let mut exp = Self::base(query, intent, mode, conversation_id);
        let error = error.into();
        exp.success = false;
        exp.error = if error.trim().is_empty() {
            UNKNOWN_ERROR.to_string()
        } else {
            error
        };
        exp
    }

    pub fn with_tool(mut self, tool: impl Into<String>, arguments: Option<serde_json::Value>) -> Self {
        self.tool_called = Some(tool.into());
        self.arguments = arguments;
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Set confidence, clamped to [0, 1].
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn with_reflection(mut self, was_reflected: bool, was_corrected: bool) -> Self {
        self.was_reflected = was_reflected;
        self.was_corrected = was_corrected;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Check the success/error invariant.
    pub fn is_consistent(&self) -> bool {
        self.success == self.error.is_empty() && (0.0..=1.0).contains(&self.confidence)
    }

    /// Serialize into a vector-store payload.
    pub fn to_payload(&self) -> Result<serde_json::Map<String, serde_json::Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "experience serialized to non-object: {other}"
            ))),
        }
    }

    /// Rebuild an experience from a vector-store payload.
    pub fn from_payload(
        payload: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(payload.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv() -> ConversationId {
        ConversationId::from("conv-1")
    }

    #[test]
    fn success_has_empty_error() {
        let exp = Experience::succeeded("2+2", "4", Intent::Calculation, ReasoningMode::ToolUse, &conv());
        assert!(exp.success);
        assert!(exp.error.is_empty());
        assert!(exp.is_consistent());
    }

    #[test]
    fn failure_always_has_error_text() {
        let exp = Experience::failed("2/0", "", Intent::Calculation, ReasoningMode::ToolUse, &conv());
        assert!(!exp.success);
        assert_eq!(exp.error, UNKNOWN_ERROR);
        assert!(exp.is_consistent());

        let exp = Experience::failed("2/0", "division by zero", Intent::Calculation, ReasoningMode::ToolUse, &conv());
        assert_eq!(exp.error, "division by zero");
    }

    #[test]
    fn confidence_is_clamped() {
        let exp = Experience::succeeded("q", "a", Intent::General, ReasoningMode::Simple, &conv())
            .with_confidence(1.7);
        assert_eq!(exp.confidence, 1.0);
        let exp = exp.with_confidence(f64::NAN);
        assert_eq!(exp.confidence, 0.0);
    }

    #[test]
    fn payload_keeps_field_names() {
        let exp = Experience::succeeded("what time is it", "noon", Intent::Datetime, ReasoningMode::ToolUse, &conv())
            .with_tool("datetime", Some(serde_json::json!({"tz": "UTC"})))
            .with_latency(120)
            .with_confidence(0.9)
            .with_reflection(true, false);
        let payload = exp.to_payload().unwrap();
        assert_eq!(payload["intent"], "datetime");
        assert_eq!(payload["reasoning_mode"], "tool_use");
        assert_eq!(payload["tool_called"], "datetime");
        assert_eq!(payload["success"], true);
        assert_eq!(payload["latency_ms"], 120);

        let back = Experience::from_payload(&payload).unwrap();
        assert_eq!(back, exp);
    }

    #[test]
    fn intent_parse_falls_back_to_general() {
        assert_eq!(Intent::parse("calculation"), Intent::Calculation);
        assert_eq!(Intent::parse("file_operation"), Intent::FileOperation);
        assert_eq!(Intent::parse("poetry"), Intent::General);
    }
}
