//! Aggregate learning report.

use kestrel_core::experience::Experience;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Below this many experiences the agent is still exploring.
pub const EXPLORING_BELOW: usize = 5;
/// Below this many experiences the agent is still learning.
pub const LEARNING_BELOW: usize = 20;
/// Minimum success rate for production readiness.
pub const PRODUCTION_SUCCESS_RATE: f64 = 0.85;
/// Minimum experiences for production readiness.
pub const PRODUCTION_MIN_EXPERIENCES: usize = 10;

const RANKED_TOOLS: usize = 3;
const WEAK_TOOL_RATE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningStage {
    Exploring,
    Learning,
    Expert,
}

impl LearningStage {
    pub fn for_count(total: usize) -> Self {
        if total < EXPLORING_BELOW {
            LearningStage::Exploring
        } else if total < LEARNING_BELOW {
            LearningStage::Learning
        } else {
            LearningStage::Expert
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LearningStage::Exploring => "exploring",
            LearningStage::Learning => "learning",
            LearningStage::Expert => "expert",
        }
    }
}

/// Outcome summary of one tool across all intents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPerformance {
    pub tool: String,
    pub calls: usize,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningReport {
    pub total_experiences: usize,
    pub stage: LearningStage,
    pub success_rate: f64,
    pub production_ready: bool,
    pub top_tools: Vec<ToolPerformance>,
    pub bottom_tools: Vec<ToolPerformance>,
    pub insights: Vec<String>,
    pub warnings: Vec<String>,
    pub store_available: bool,
}

impl LearningReport {
    /// Build a report over a window of experiences.
    pub fn build(experiences: &[Experience], store_available: bool, min_sample_size: usize) -> Self {
        Self::from_window(experiences, experiences.len(), store_available, min_sample_size)
    }

    /// Report over a window of recent `experiences` out of `total_experiences`
    /// stored. Rates and rankings come from the window; the total and the
    /// stage come from the full count.
    pub fn from_window(
        experiences: &[Experience],
        total_experiences: usize,
        store_available: bool,
        min_sample_size: usize,
    ) -> Self {
        let total = total_experiences.max(experiences.len());
        let successes = experiences.iter().filter(|e| e.success).count();
        let success_rate = if experiences.is_empty() {
            0.0
        } else {
            successes as f64 / experiences.len() as f64
        };
        let stage = LearningStage::for_count(total);
        let production_ready =
            success_rate >= PRODUCTION_SUCCESS_RATE && total >= PRODUCTION_MIN_EXPERIENCES;

        let tools = tool_performance(experiences);
        let mut ranked = tools.clone();
        ranked.sort_by(|a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then_with(|| a.avg_latency_ms.total_cmp(&b.avg_latency_ms))
        });
        let top_tools: Vec<_> = ranked.iter().take(RANKED_TOOLS).cloned().collect();
        let bottom_tools: Vec<_> = ranked.iter().rev().take(RANKED_TOOLS).cloned().collect();

        let mut insights = Vec::new();
        let mut warnings = Vec::new();

        insights.push(format!(
            "Stage {}: {total} experiences, {:.0}% success",
            stage.as_str(),
            success_rate * 100.0
        ));
        if let Some(best) = top_tools.first() {
            insights.push(format!(
                "{} is the most reliable tool ({:.0}% over {} calls)",
                best.tool,
                best.success_rate * 100.0,
                best.calls
            ));
        }
        let reflected = experiences.iter().filter(|e| e.was_reflected).count();
        let corrected = experiences.iter().filter(|e| e.was_corrected).count();
        if reflected > 0 {
            insights.push(format!("Reflection corrected {corrected} of {reflected} reviewed answers"));
        }
        if production_ready {
            insights.push("Success rate meets the production threshold".to_string());
        }

        for tool in &tools {
            if tool.calls >= min_sample_size && tool.success_rate < WEAK_TOOL_RATE {
                warnings.push(format!(
                    "{} fails often: {:.0}% success over {} calls",
                    tool.tool,
                    tool.success_rate * 100.0,
                    tool.calls
                ));
            }
        }
        if !store_available {
            warnings.push("Experience store unavailable; learning is running without persistence".to_string());
        }

        Self {
            total_experiences: total,
            stage,
            success_rate,
            production_ready,
            top_tools,
            bottom_tools,
            insights,
            warnings,
            store_available,
        }
    }
}

/// Per-tool outcomes, tools sorted by name.
pub fn tool_performance(experiences: &[Experience]) -> Vec<ToolPerformance> {
    let mut acc: BTreeMap<&str, (usize, usize, u64)> = BTreeMap::new();
    for exp in experiences {
        if let Some(tool) = exp.tool_called.as_deref() {
            let entry = acc.entry(tool).or_default();
            entry.0 += 1;
            if exp.success {
                entry.1 += 1;
            }
            entry.2 += exp.latency_ms;
        }
    }
    acc.into_iter()
        .map(|(tool, (calls, ok, latency))| ToolPerformance {
            tool: tool.to_string(),
            calls,
            success_rate: ok as f64 / calls as f64,
            avg_latency_ms: latency as f64 / calls as f64,
        })
        .collect()
}
