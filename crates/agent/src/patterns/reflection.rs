//! Confidence-gated reflection.
//!
//! Given the question and a provisional answer, the reflector asks the
//! model to list the verifiable claims, optionally check them with the
//! available tools, and reply with a JSON verdict:
//!
//! ```json
//! {"claims": ["..."], "confidence": 0.8, "corrected_answer": null}
//! ```
//!
//! The answer is replaced only when the confidence is below the threshold
//! and a non-empty correction is present.

use kestrel_core::error::{Error, Result};
use kestrel_core::message::Message;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::WorkingMemory;
use crate::engine::{Engine, TurnContext};

pub const REFLECTION_INSTRUCTIONS: &str = "You review answers for accuracy. \
List the verifiable claims in the answer and verify them with the available tools when you can. \
Then reply with only a JSON object: {\"claims\": [string], \"confidence\": number between 0 and 1, \
\"corrected_answer\": string or null}. Provide corrected_answer only if the answer is wrong.";

#[derive(Debug, Clone, Deserialize)]
struct Verdict {
    #[serde(default)]
    claims: Vec<String>,
    confidence: f64,
    #[serde(default)]
    corrected_answer: Option<String>,
}

/// What reflection concluded about one answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionOutcome {
    pub confidence: f64,
    pub claims: Vec<String>,
    /// The replacement answer, set only when the answer was corrected.
    pub corrected_answer: Option<String>,
}

impl ReflectionOutcome {
    pub fn was_corrected(&self) -> bool {
        self.corrected_answer.is_some()
    }
}

pub struct Reflector {
    engine: Arc<Engine>,
    threshold: f64,
    max_verification_steps: u32,
}

impl Reflector {
    pub fn new(engine: Arc<Engine>, threshold: f64, max_verification_steps: u32) -> Self {
        Self {
            engine,
            threshold,
            max_verification_steps,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Review `answer`. Verification tool runs are recorded in `wm`.
    ///
    /// Malformed verdicts and exhausted verification budgets are reported
    /// as [`Error::Reflection`]; cancellation and provider errors pass
    /// through unchanged.
    pub async fn reflect(
        &self,
        question: &str,
        answer: &str,
        turn: &TurnContext,
        wm: &mut WorkingMemory,
    ) -> Result<ReflectionOutcome> {
        let mut messages = vec![Message::user(format!(
            "Question:\n{question}\n\nAnswer to review:\n{answer}"
        ))];

        // One round for the verdict plus the verification rounds
        for round in 0..=self.max_verification_steps {
            let request = self
                .engine
                .request(Some(REFLECTION_INSTRUCTIONS), messages.clone(), true);
            let reply = self.engine.call(request, turn, false).await?;

            if reply.tool_calls.is_empty() {
                let outcome = self.judge(&reply.content)?;
                wm.add_reflection(&format!(
                    "confidence {:.2} over {} claims{}",
                    outcome.confidence,
                    outcome.claims.len(),
                    if outcome.was_corrected() { ", corrected" } else { "" }
                ));
                info!(
                    confidence = outcome.confidence,
                    corrected = outcome.was_corrected(),
                    "Reflection complete"
                );
                return Ok(outcome);
            }

            if round == self.max_verification_steps {
                break;
            }

            debug!(round, calls = reply.tool_calls.len(), "Reflection verifying claims");
            let results = self
                .engine
                .execute_tools(&reply.tool_calls, turn, wm)
                .await?;
            messages.push(reply);
            messages.extend(results);
        }

        Err(Error::Reflection(format!(
            "no verdict after {} verification steps",
            self.max_verification_steps
        )))
    }

    fn judge(&self, content: &str) -> Result<ReflectionOutcome> {
        let json = first_json_object(content)
            .ok_or_else(|| Error::Reflection("verdict contained no JSON object".into()))?;
        let verdict: Verdict = serde_json::from_str(json)
            .map_err(|e| Error::Reflection(format!("malformed verdict: {e}")))?;
        if !verdict.confidence.is_finite() {
            return Err(Error::Reflection("confidence is not a number".into()));
        }

        let confidence = verdict.confidence.clamp(0.0, 1.0);
        let corrected_answer = verdict
            .corrected_answer
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty() && confidence < self.threshold);

        Ok(ReflectionOutcome {
            confidence,
            claims: verdict.claims,
            corrected_answer,
        })
    }
}

/// The first balanced `{...}` block in `text`, skipping braces inside strings.
pub fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
