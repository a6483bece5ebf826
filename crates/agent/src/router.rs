//! Query routing and intent detection.
//!
//! The conversation loop asks a [`QueryClassifier`] which reasoning
//! strategy a query needs and which [`Intent`] it expresses. The bundled
//! [`HeuristicClassifier`] uses keyword and pattern rules; anything else
//! (a learned model, a remote service) can be plugged in through the trait.
//!
//! Routing rules, first match wins:
//!
//! 1. explicit tool phrasing ("use the calculator", "search the web") → tool use
//! 2. an arithmetic expression or a calculation verb → tool use
//! 3. reasoning cues ("step by step", "why", "prove") → chain-of-thought
//! 4. registered tools plus an action verb ("search", "find", "fetch") → tool use
//! 5. otherwise → simple

use kestrel_core::experience::{Intent, ReasoningMode};
use kestrel_memory::tokenize;
use std::collections::HashSet;

/// Pluggable strategy and intent classification.
pub trait QueryClassifier: Send + Sync {
    /// Pick a reasoning strategy. Never fails; the fallback is `Simple`.
    fn route(&self, query: &str, has_tools: bool) -> ReasoningMode;

    /// Coarse intent used to scope tool statistics.
    fn detect_intent(&self, query: &str) -> Intent;
}

const TOOL_PHRASES: &[&str] = &[
    "use the",
    "using the",
    "use a tool",
    "with the tool",
    "call the",
    "search the web",
    "search online",
    "web search",
    "look up",
    "fetch from",
];

const CALC_VERBS: &[&str] = &["calculate", "compute", "solve", "evaluate"];

const REASONING_PHRASES: &[&str] = &["step by step", "step-by-step", "explain how", "walk me through"];
const REASONING_WORDS: &[&str] = &["why", "prove", "derive", "reason", "justify"];

const ACTION_VERBS: &[&str] = &["search", "find", "fetch", "lookup", "retrieve", "read", "list", "check"];

const CALC_WORDS: &[&str] = &[
    "calculate", "compute", "solve", "evaluate", "sum", "average", "percent", "percentage",
    "multiply", "divide", "plus", "minus", "times", "sqrt",
];
const FILE_WORDS: &[&str] = &["file", "files", "directory", "folder", "path", "read", "write", "save", "open"];
const DATETIME_WORDS: &[&str] = &[
    "time", "date", "today", "tomorrow", "yesterday", "clock", "timezone", "weekday", "calendar",
];
const SYSTEM_WORDS: &[&str] = &[
    "cpu", "ram", "disk", "os", "hostname", "uptime", "process", "processes", "system", "kernel",
];
const RETRIEVAL_WORDS: &[&str] = &[
    "search", "find", "who", "what", "where", "news", "weather", "latest", "information",
    "lookup", "fetch", "wikipedia",
];

/// Keyword and pattern based classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    pub fn new() -> Self {
        Self
    }
}

struct Signals {
    lowered: String,
    words: HashSet<String>,
}

impl Signals {
    fn new(query: &str) -> Self {
        Self {
            lowered: query.to_lowercase(),
            words: tokenize(query).collect(),
        }
    }

    fn has_phrase(&self, phrases: &[&str]) -> bool {
        phrases.iter().any(|p| contains_phrase(&self.lowered, p))
    }

    fn has_word(&self, words: &[&str]) -> bool {
        words.iter().any(|w| self.words.contains(*w))
    }

    fn is_calculation(&self) -> bool {
        has_arithmetic(&self.lowered) || self.has_word(CALC_VERBS)
    }
}

impl QueryClassifier for HeuristicClassifier {
    fn route(&self, query: &str, has_tools: bool) -> ReasoningMode {
        let signals = Signals::new(query);

        if signals.has_phrase(TOOL_PHRASES) || signals.is_calculation() {
            return ReasoningMode::ToolUse;
        }
        if signals.has_phrase(REASONING_PHRASES) || signals.has_word(REASONING_WORDS) {
            return ReasoningMode::ChainOfThought;
        }
        if has_tools && signals.has_word(ACTION_VERBS) {
            return ReasoningMode::ToolUse;
        }
        ReasoningMode::Simple
    }

    fn detect_intent(&self, query: &str) -> Intent {
        let signals = Signals::new(query);

        if signals.is_calculation() || signals.has_word(CALC_WORDS) {
            Intent::Calculation
        } else if signals.has_word(FILE_WORDS) {
            Intent::FileOperation
        } else if signals.has_word(DATETIME_WORDS) {
            Intent::Datetime
        } else if signals.has_word(SYSTEM_WORDS) {
            Intent::SystemInfo
        } else if signals.has_word(RETRIEVAL_WORDS) || signals.has_phrase(&["look up", "search the web"]) {
            Intent::InformationRetrieval
        } else {
            Intent::General
        }
    }
}

/// `phrase` occurring at a word start, so "because the" is not "use the".
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    haystack.match_indices(phrase).any(|(i, _)| {
        haystack[..i]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric())
    })
}

/// A number, an operator, and another number, spaces allowed between them.
pub fn has_arithmetic(text: &str) -> bool {
    let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    chars.windows(3).any(|w| {
        (w[0].is_ascii_digit() || w[0] == ')' || w[0] == '.')
            && matches!(w[1], '+' | '-' | '*' | '/' | '^' | '%' | '×' | '÷')
            && (w[2].is_ascii_digit() || w[2] == '(' || w[2] == '.')
    })
}
