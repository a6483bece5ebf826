//! # Kestrel Learning
//!
//! Experiential learning for the agent: every completed call becomes an
//! [`Experience`](kestrel_core::Experience), written in the background by the
//! [`ExperienceRecorder`] and mined on demand by the [`ToolSelector`]
//! (ε-greedy bandit over tool outcomes) and the [`ErrorPatternAnalyzer`]
//! (clusters of similar failures with suggested corrections).
//!
//! Nothing here may break a chat call: every failure is reported as a
//! [`LearningError`] for the agent to log and swallow.

pub mod error_patterns;
pub mod experience_store;
pub mod recorder;
pub mod report;
pub mod tool_selector;

pub use error_patterns::{
    classify_error, ErrorCluster, ErrorPattern, ErrorPatternAnalyzer, ErrorType, PatternSettings,
    AD_HOC_CONFIDENCE,
};
pub use experience_store::{ExperienceQuery, ExperienceStore, EXPERIENCE_COLLECTION};
pub use recorder::{ExperienceRecorder, RecorderSettings, RecorderStats};
pub use report::{LearningReport, LearningStage, ToolPerformance};
pub use tool_selector::{DecisionStrategy, SelectorSettings, ToolRecommendation, ToolSelector, ToolStats};

use kestrel_config::LearningConfig;
use kestrel_core::error::LearningError;
use kestrel_core::event::EventBus;
use kestrel_core::experience::{Experience, Intent};
use std::sync::Arc;
use tracing::debug;

/// The store, recorder, selector, and analyzer wired together.
pub struct LearningSystem {
    config: LearningConfig,
    store: Arc<ExperienceStore>,
    recorder: Option<ExperienceRecorder>,
    selector: ToolSelector,
    analyzer: ErrorPatternAnalyzer,
}

impl LearningSystem {
    /// Wire the components. The recorder workers start on the current
    /// runtime; with `config.enabled == false` nothing is recorded.
    pub fn new(
        config: &LearningConfig,
        store: ExperienceStore,
        available_tools: Vec<String>,
        events: Option<Arc<EventBus>>,
    ) -> Result<Self, LearningError> {
        let store = Arc::new(store);
        let recorder = if config.enabled {
            Some(ExperienceRecorder::spawn(
                store.clone(),
                RecorderSettings::from(config),
                events,
            )?)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            selector: ToolSelector::new(store.clone(), SelectorSettings::from(config))
                .with_available_tools(available_tools),
            analyzer: ErrorPatternAnalyzer::new(store.clone(), PatternSettings::from(config)),
            store,
            recorder,
        })
    }

    /// Replace the selector's RNG with a seeded one.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.selector = self.selector.with_rng_seed(seed);
        self
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ExperienceStore> {
        &self.store
    }

    pub fn selector(&self) -> &ToolSelector {
        &self.selector
    }

    pub fn analyzer(&self) -> &ErrorPatternAnalyzer {
        &self.analyzer
    }

    pub fn is_enabled(&self) -> bool {
        self.recorder.is_some()
    }

    /// Hand an experience to the background recorder.
    pub async fn record(&self, experience: Experience) -> Result<bool, LearningError> {
        match &self.recorder {
            Some(recorder) => recorder.submit(experience).await,
            None => {
                debug!(experience_id = %experience.id, "Learning disabled; experience not recorded");
                Ok(false)
            }
        }
    }

    /// Wait for every queued experience to be written.
    pub async fn flush(&self) {
        if let Some(recorder) = &self.recorder {
            recorder.flush().await;
        }
    }

    pub fn recorder_stats(&self) -> RecorderStats {
        self.recorder.as_ref().map(|r| r.stats()).unwrap_or_default()
    }

    pub async fn recommend(&self, query: &str, intent: Intent) -> Result<Option<ToolRecommendation>, LearningError> {
        self.selector.recommend(query, intent).await
    }

    pub async fn tool_stats(&self, tool: &str, intent: Intent) -> Result<Option<ToolStats>, LearningError> {
        self.selector.get_stats(tool, intent).await
    }

    pub async fn detect_patterns(&self) -> Result<Vec<ErrorPattern>, LearningError> {
        self.analyzer.detect_patterns().await
    }

    pub async fn suggest_correction(&self, query: &str, error: &str) -> Result<ErrorPattern, LearningError> {
        self.analyzer.suggest_correction(query, error).await
    }

    /// Aggregate report. Rates and tool rankings cover the most recent
    /// `stats_window` experiences; the total counts the whole store.
    pub async fn report(&self) -> Result<LearningReport, LearningError> {
        let experiences = self
            .store
            .query(&ExperienceQuery::recent(self.config.stats_window))
            .await?;
        let total = self.store.count().await?;
        Ok(LearningReport::from_window(
            &experiences,
            total,
            self.store.is_available(),
            self.config.min_sample_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experience_store::tests::{failure, memory_store, success};

    #[tokio::test]
    async fn records_through_recorder_and_reports() {
        let system = LearningSystem::new(
            &LearningConfig::default(),
            memory_store(),
            vec!["calculator".into()],
            None,
        )
        .unwrap();

        for i in 0..6 {
            assert!(system
                .record(success(&format!("{i} + 1"), "calculator", Intent::Calculation, 20))
                .await
                .unwrap());
        }
        system
            .record(failure("1 / 0", "calculator", Intent::Calculation, "division by zero"))
            .await
            .unwrap();
        system.flush().await;

        let report = system.report().await.unwrap();
        assert_eq!(report.total_experiences, 7);
        assert_eq!(report.stage, LearningStage::Learning);
        assert!(report.store_available);

        let stats = system.tool_stats("calculator", Intent::Calculation).await.unwrap().unwrap();
        assert_eq!(stats.total_calls, 7);
        assert_eq!(stats.failures, 1);
        assert_eq!(system.recorder_stats().written, 7);
    }

    #[tokio::test]
    async fn report_counts_beyond_the_stats_window() {
        let config = LearningConfig {
            stats_window: 5,
            ..LearningConfig::default()
        };
        let system = LearningSystem::new(&config, memory_store(), vec!["calculator".into()], None).unwrap();

        for i in 0..8 {
            system
                .record(success(&format!("{i} * 2"), "calculator", Intent::Calculation, 15))
                .await
                .unwrap();
        }
        system.flush().await;

        assert_eq!(system.store().count().await.unwrap(), 8);
        let report = system.report().await.unwrap();
        assert_eq!(report.total_experiences, 8);
        assert_eq!(report.stage, LearningStage::Learning);
        assert_eq!(report.top_tools[0].calls, 5);
    }

    #[tokio::test]
    async fn disabled_learning_records_nothing() {
        let config = LearningConfig {
            enabled: false,
            ..LearningConfig::default()
        };
        let system = LearningSystem::new(&config, memory_store(), vec![], None).unwrap();
        assert!(!system.is_enabled());
        assert!(!system
            .record(success("q", "calculator", Intent::Calculation, 1))
            .await
            .unwrap());
        system.flush().await;
        assert_eq!(system.store().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn degraded_store_still_reports() {
        let system = LearningSystem::new(
            &LearningConfig::default(),
            ExperienceStore::disabled(),
            vec![],
            None,
        )
        .unwrap();
        let report = system.report().await.unwrap();
        assert!(!report.store_available);
        assert_eq!(report.total_experiences, 0);
    }
}
