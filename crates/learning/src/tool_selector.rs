//! ε-greedy tool selection.
//!
//! Statistics are recomputed from the experience store on every call; nothing
//! is cached between recommendations.

use kestrel_config::LearningConfig;
use kestrel_core::error::LearningError;
use kestrel_core::experience::{Experience, Intent};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::experience_store::{ExperienceQuery, ExperienceStore};

/// Per (tool, intent) outcome statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub tool: String,
    pub intent: Intent,
    pub total_calls: usize,
    pub successes: usize,
    pub failures: usize,
    /// `successes / total_calls`, always in [0, 1]
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

/// How a recommendation was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStrategy {
    Learned,
    Exploration,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRecommendation {
    pub tool_name: String,
    pub confidence: f64,
    pub reasoning: String,
    pub decision_strategy: DecisionStrategy,
    pub is_exploration: bool,
    /// Recorded calls of the recommended tool under the intent
    pub sample_size: usize,
}

/// Tunables of the bandit.
#[derive(Debug, Clone)]
pub struct SelectorSettings {
    pub epsilon: f64,
    pub min_sample_size: usize,
    pub success_weight: f64,
    pub latency_weight: f64,
    /// Experiences scanned per recommendation
    pub stats_window: usize,
    pub default_tools: HashMap<String, String>,
}

impl From<&LearningConfig> for SelectorSettings {
    fn from(config: &LearningConfig) -> Self {
        Self {
            epsilon: config.epsilon,
            min_sample_size: config.min_sample_size,
            success_weight: config.success_weight,
            latency_weight: config.latency_weight,
            stats_window: config.stats_window,
            default_tools: config.default_tools.clone(),
        }
    }
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self::from(&LearningConfig::default())
    }
}

/// Aggregate tool experiences under one intent. Experiences without a tool
/// are ignored.
pub fn compute_stats(experiences: &[Experience], intent: Intent) -> BTreeMap<String, ToolStats> {
    let mut acc: BTreeMap<String, (usize, usize, u64)> = BTreeMap::new();
    for exp in experiences.iter().filter(|e| e.intent == intent) {
        let Some(tool) = &exp.tool_called else {
            continue;
        };
        let entry = acc.entry(tool.clone()).or_default();
        entry.0 += 1;
        if exp.success {
            entry.1 += 1;
        }
        entry.2 += exp.latency_ms;
    }

    acc.into_iter()
        .map(|(tool, (calls, successes, latency))| {
            let stats = ToolStats {
                tool: tool.clone(),
                intent,
                total_calls: calls,
                successes,
                failures: calls - successes,
                success_rate: successes as f64 / calls as f64,
                avg_latency_ms: latency as f64 / calls as f64,
            };
            (tool, stats)
        })
        .collect()
}

/// The bandit.
pub struct ToolSelector {
    store: Arc<ExperienceStore>,
    settings: SelectorSettings,
    /// Tools the agent can actually call; empty means "whatever was observed"
    available: Vec<String>,
    rng: Mutex<StdRng>,
}

impl ToolSelector {
    pub fn new(store: Arc<ExperienceStore>, settings: SelectorSettings) -> Self {
        Self {
            store,
            settings,
            available: Vec::new(),
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Restrict candidates to these tool names.
    pub fn with_available_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.available = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Deterministic exploration, for reproducible runs.
    pub fn with_rng_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn settings(&self) -> &SelectorSettings {
        &self.settings
    }

    async fn intent_stats(&self, intent: Intent) -> Result<BTreeMap<String, ToolStats>, LearningError> {
        let experiences = self
            .store
            .query(&ExperienceQuery::recent(self.settings.stats_window).with_intent(intent))
            .await?;
        Ok(compute_stats(&experiences, intent))
    }

    /// Statistics for one (tool, intent) pair; `None` when it was never called.
    pub async fn get_stats(&self, tool: &str, intent: Intent) -> Result<Option<ToolStats>, LearningError> {
        Ok(self.intent_stats(intent).await?.remove(tool))
    }

    /// Composite score: `w_s * success_rate + w_l * (1 - latency / slowest)`.
    pub fn score(&self, stats: &ToolStats, slowest_latency_ms: f64) -> f64 {
        let normalized_latency = if slowest_latency_ms > 0.0 {
            stats.avg_latency_ms / slowest_latency_ms
        } else {
            0.0
        };
        self.settings.success_weight * stats.success_rate
            + self.settings.latency_weight * (1.0 - normalized_latency)
    }

    fn pick<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let idx = match self.rng.lock() {
            Ok(mut rng) => rng.random_range(0..items.len()),
            Err(poisoned) => poisoned.into_inner().random_range(0..items.len()),
        };
        items.get(idx)
    }

    fn roll_explore(&self) -> bool {
        let roll: f64 = match self.rng.lock() {
            Ok(mut rng) => rng.random(),
            Err(poisoned) => poisoned.into_inner().random(),
        };
        roll < self.settings.epsilon
    }

    /// Recommend a tool for `query` under `intent`.
    ///
    /// With no history for the intent the configured default tool is used.
    /// Returns `None` only when there is no candidate tool at all.
    pub async fn recommend(&self, query: &str, intent: Intent) -> Result<Option<ToolRecommendation>, LearningError> {
        let stats = self.intent_stats(intent).await?;

        if stats.is_empty() {
            let default = self
                .settings
                .default_tools
                .get(intent.as_str())
                .filter(|tool| self.available.is_empty() || self.available.contains(tool));
            if let Some(tool) = default {
                return Ok(Some(ToolRecommendation {
                    tool_name: tool.clone(),
                    confidence: 0.5,
                    reasoning: format!("No experience for {intent} yet; using the configured default"),
                    decision_strategy: DecisionStrategy::Default,
                    is_exploration: true,
                    sample_size: 0,
                }));
            }
        }

        let observed: Vec<ToolStats> = stats
            .into_values()
            .filter(|s| self.available.is_empty() || self.available.contains(&s.tool))
            .collect();
        // Registered tools never used for this intent; reachable through ε only
        let unseen: Vec<ToolStats> = self
            .available
            .iter()
            .filter(|tool| !observed.iter().any(|s| &s.tool == *tool))
            .map(|tool| empty_stats(tool, intent))
            .collect();

        let slowest = observed
            .iter()
            .map(|s| s.avg_latency_ms)
            .fold(0.0_f64, f64::max);
        let best = observed.iter().max_by(|a, b| {
            self.score(a, slowest)
                .total_cmp(&self.score(b, slowest))
                // lower latency wins a tie, so it must compare as "greater"
                .then_with(|| b.avg_latency_ms.total_cmp(&a.avg_latency_ms))
        });

        let Some(best) = best else {
            // Nothing observed is callable: try one of the registered tools
            return Ok(self.pick(&unseen).map(|choice| {
                debug!(tool = %choice.tool, %intent, query, "Exploring unseen tool");
                ToolRecommendation {
                    tool_name: choice.tool.clone(),
                    confidence: 0.0,
                    reasoning: format!("No callable tool has history for {intent}; trying {}", choice.tool),
                    decision_strategy: DecisionStrategy::Exploration,
                    is_exploration: true,
                    sample_size: 0,
                }
            }));
        };

        let min = self.settings.min_sample_size;
        if best.total_calls < min {
            let under_sampled: Vec<&ToolStats> = observed.iter().filter(|s| s.total_calls < min).collect();
            if let Some(choice) = self.pick(&under_sampled) {
                debug!(tool = %choice.tool, %intent, query, "Forced exploration of under-sampled tool");
                return Ok(Some(ToolRecommendation {
                    tool_name: choice.tool.clone(),
                    confidence: 0.5 * choice.success_rate,
                    reasoning: format!(
                        "Exploring {}: only {} of {} required calls recorded for {intent}",
                        choice.tool, choice.total_calls, min
                    ),
                    decision_strategy: DecisionStrategy::Exploration,
                    is_exploration: true,
                    sample_size: choice.total_calls,
                }));
            }
        }

        if self.roll_explore() {
            let pool: Vec<&ToolStats> = observed.iter().chain(unseen.iter()).collect();
            if let Some(choice) = self.pick(&pool) {
                debug!(tool = %choice.tool, %intent, "ε-exploration");
                return Ok(Some(ToolRecommendation {
                    tool_name: choice.tool.clone(),
                    confidence: if choice.total_calls == 0 {
                        0.0
                    } else {
                        self.score(choice, slowest).clamp(0.0, 1.0)
                    },
                    reasoning: format!(
                        "Random exploration (ε = {:.2}) picked {}",
                        self.settings.epsilon, choice.tool
                    ),
                    decision_strategy: DecisionStrategy::Exploration,
                    is_exploration: true,
                    sample_size: choice.total_calls,
                }));
            }
        }

        let score = self.score(best, slowest);
        Ok(Some(ToolRecommendation {
            tool_name: best.tool.clone(),
            confidence: score.clamp(0.0, 1.0),
            reasoning: format!(
                "{} has the best score for {intent}: {:.0}% success over {} calls, {:.0}ms average",
                best.tool,
                best.success_rate * 100.0,
                best.total_calls,
                best.avg_latency_ms
            ),
            decision_strategy: DecisionStrategy::Learned,
            is_exploration: false,
            sample_size: best.total_calls,
        }))
    }
}

fn empty_stats(tool: &str, intent: Intent) -> ToolStats {
    ToolStats {
        tool: tool.to_string(),
        intent,
        total_calls: 0,
        successes: 0,
        failures: 0,
        success_rate: 0.0,
        avg_latency_ms: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experience_store::tests::{failure, memory_store, success};

    async fn seed(store: &ExperienceStore, tool: &str, ok: usize, failed: usize, latency_ms: u64) {
        for i in 0..ok {
            store
                .record(&success(&format!("{tool} ok {i}"), tool, Intent::Calculation, latency_ms))
                .await
                .unwrap();
        }
        for i in 0..failed {
            let mut exp = failure(&format!("{tool} fail {i}"), tool, Intent::Calculation, "boom");
            exp.latency_ms = latency_ms;
            store.record(&exp).await.unwrap();
        }
    }

    #[test]
    fn stats_are_per_intent_and_bounded() {
        let exps = vec![
            success("a", "calculator", Intent::Calculation, 100),
            failure("b", "calculator", Intent::Calculation, "x"),
            success("c", "calculator", Intent::General, 10),
            Experience::succeeded(
                "d",
                "e",
                Intent::Calculation,
                kestrel_core::ReasoningMode::Simple,
                &kestrel_core::ConversationId::from("t"),
            ),
        ];
        let stats = compute_stats(&exps, Intent::Calculation);
        assert_eq!(stats.len(), 1);
        let calc = &stats["calculator"];
        assert_eq!(calc.total_calls, 2);
        assert_eq!(calc.successes, 1);
        assert_eq!(calc.failures, 1);
        assert!((calc.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((calc.avg_latency_ms - 75.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn no_stats_for_unused_pair() {
        let store = Arc::new(memory_store());
        let selector = ToolSelector::new(store, SelectorSettings::default());
        assert!(selector.get_stats("calculator", Intent::Calculation).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn under_sampled_best_always_explores() {
        let store = Arc::new(memory_store());
        // calculator scores best but has only 2 of 3 required calls
        seed(&store, "calculator", 2, 0, 10).await;
        seed(&store, "wolfram", 3, 2, 50).await;
        let selector = ToolSelector::new(store, SelectorSettings::default()).with_rng_seed(7);

        for _ in 0..50 {
            let rec = selector.recommend("2+2", Intent::Calculation).await.unwrap().unwrap();
            assert!(rec.is_exploration);
            assert_eq!(rec.decision_strategy, DecisionStrategy::Exploration);
            assert_eq!(rec.tool_name, "calculator");
            assert_eq!(rec.sample_size, 2);
        }
    }

    #[tokio::test]
    async fn well_sampled_best_is_exploited_beside_under_sampled_tools() {
        let store = Arc::new(memory_store());
        seed(&store, "calculator", 2, 0, 10).await;
        seed(&store, "wolfram", 5, 0, 5).await;
        let settings = SelectorSettings {
            epsilon: 0.0,
            ..SelectorSettings::default()
        };
        let selector = ToolSelector::new(store, settings);

        let rec = selector.recommend("2+2", Intent::Calculation).await.unwrap().unwrap();
        assert!(!rec.is_exploration);
        assert_eq!(rec.decision_strategy, DecisionStrategy::Learned);
        assert_eq!(rec.tool_name, "wolfram");
        assert_eq!(rec.sample_size, 5);
    }

    #[tokio::test]
    async fn registered_but_unused_tools_do_not_block_exploitation() {
        let store = Arc::new(memory_store());
        seed(&store, "calculator", 50, 0, 20).await;
        let selector = ToolSelector::new(store, SelectorSettings::default())
            .with_available_tools(["calculator", "web_search", "file_read"])
            .with_rng_seed(11);

        let mut learned = 0;
        let mut unseen_explored = 0;
        for _ in 0..200 {
            let rec = selector.recommend("12 * 7", Intent::Calculation).await.unwrap().unwrap();
            if rec.is_exploration {
                if rec.tool_name != "calculator" {
                    unseen_explored += 1;
                    assert_eq!(rec.sample_size, 0);
                }
            } else {
                learned += 1;
                assert_eq!(rec.tool_name, "calculator");
            }
        }
        assert!(learned >= 160, "learned {learned}/200");
        assert!(unseen_explored > 0);
    }

    #[tokio::test]
    async fn unseen_tool_is_only_reached_through_epsilon() {
        let store = Arc::new(memory_store());
        seed(&store, "calculator", 5, 0, 10).await;
        let always_explore = SelectorSettings {
            epsilon: 1.0,
            ..SelectorSettings::default()
        };
        let selector = ToolSelector::new(store.clone(), always_explore)
            .with_available_tools(["calculator", "wolfram"])
            .with_rng_seed(3);

        let mut saw_wolfram = false;
        for _ in 0..50 {
            let rec = selector.recommend("2+2", Intent::Calculation).await.unwrap().unwrap();
            assert!(rec.is_exploration);
            if rec.tool_name == "wolfram" {
                saw_wolfram = true;
                assert_eq!(rec.sample_size, 0);
            }
        }
        assert!(saw_wolfram);

        let never_explore = SelectorSettings {
            epsilon: 0.0,
            ..SelectorSettings::default()
        };
        let selector = ToolSelector::new(store, never_explore).with_available_tools(["calculator", "wolfram"]);
        let rec = selector.recommend("2+2", Intent::Calculation).await.unwrap().unwrap();
        assert_eq!(rec.tool_name, "calculator");
        assert!(!rec.is_exploration);
    }

    #[tokio::test]
    async fn history_of_unavailable_tools_falls_back_to_registered_ones() {
        let store = Arc::new(memory_store());
        seed(&store, "wolfram", 5, 0, 10).await;
        let selector = ToolSelector::new(store, SelectorSettings::default()).with_available_tools(["calculator"]);

        let rec = selector.recommend("2+2", Intent::Calculation).await.unwrap().unwrap();
        assert_eq!(rec.tool_name, "calculator");
        assert!(rec.is_exploration);
    }

    #[tokio::test]
    async fn default_when_nothing_known() {
        let store = Arc::new(memory_store());
        let selector = ToolSelector::new(store, SelectorSettings::default());

        let rec = selector.recommend("what time is it", Intent::Datetime).await.unwrap().unwrap();
        assert_eq!(rec.decision_strategy, DecisionStrategy::Default);
        assert_eq!(rec.tool_name, "datetime");

        assert!(selector.recommend("hello", Intent::General).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn exploration_rate_converges_to_epsilon_and_exploit_is_argmax() {
        let store = Arc::new(memory_store());
        // calculator: 0.7 * 0.9 + 0.3 * (1 - 100/100) = 0.63
        seed(&store, "calculator", 9, 1, 100).await;
        // wolfram:    0.7 * 0.5 + 0.3 * (1 - 50/100)  = 0.50
        seed(&store, "wolfram", 5, 5, 50).await;

        let selector = ToolSelector::new(store, SelectorSettings::default()).with_rng_seed(42);
        let trials = 2000;
        let mut explored = 0;
        for _ in 0..trials {
            let rec = selector.recommend("12 * 7", Intent::Calculation).await.unwrap().unwrap();
            if rec.is_exploration {
                explored += 1;
            } else {
                assert_eq!(rec.tool_name, "calculator");
                assert_eq!(rec.decision_strategy, DecisionStrategy::Learned);
                assert_eq!(rec.sample_size, 10);
            }
        }
        let rate = explored as f64 / trials as f64;
        assert!((rate - 0.10).abs() < 0.03, "exploration rate {rate}");
    }

    #[tokio::test]
    async fn ties_go_to_lower_latency() {
        let store = Arc::new(memory_store());
        seed(&store, "slow", 4, 0, 200).await;
        seed(&store, "fast", 4, 0, 50).await;
        // success only: both score 0.7
        let settings = SelectorSettings {
            epsilon: 0.0,
            latency_weight: 0.0,
            ..SelectorSettings::default()
        };
        let selector = ToolSelector::new(store, settings);

        let rec = selector.recommend("x", Intent::Calculation).await.unwrap().unwrap();
        assert!(!rec.is_exploration);
        assert_eq!(rec.tool_name, "fast");
    }

    #[tokio::test]
    async fn weights_are_configurable() {
        let store = Arc::new(memory_store());
        seed(&store, "accurate", 10, 0, 1000).await;
        seed(&store, "quick", 6, 4, 10).await;
        let latency_only = SelectorSettings {
            epsilon: 0.0,
            success_weight: 0.0,
            latency_weight: 1.0,
            ..SelectorSettings::default()
        };
        let selector = ToolSelector::new(store, latency_only);
        let rec = selector.recommend("x", Intent::Calculation).await.unwrap().unwrap();
        assert_eq!(rec.tool_name, "quick");
    }
}
