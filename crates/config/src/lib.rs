//! Configuration loading, validation, and management for Kestrel.
//!
//! Loads configuration from `~/.kestrel/config.toml` with environment
//! variable overrides. Validates all settings at startup. Every tunable of
//! the conversation loop and the learning subsystem lives here, including
//! the exploration rate, minimum sample size, and the scoring weights of the
//! tool selector.

pub mod logging;

use kestrel_core::Intent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use logging::{init_logging, LoggingConfig};

/// The root configuration structure.
///
/// Maps directly to `~/.kestrel/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Conversation loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Memory configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Experiential learning configuration
    #[serde(default)]
    pub learning: LearningConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Think/act/observe rounds before the call fails
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// LLM-only reasoning steps for chain-of-thought
    #[serde(default = "default_max_cot_steps")]
    pub max_cot_steps: u32,

    #[serde(default = "default_true")]
    pub reflection_enabled: bool,

    /// Answers scored below this are replaced when a correction exists
    #[serde(default = "default_reflection_threshold")]
    pub reflection_threshold: f64,

    /// Tool rounds the reflector may use to verify claims
    #[serde(default = "default_max_verification_steps")]
    pub max_verification_steps: u32,

    /// Turns of history sent to the model, 0 = everything buffered
    #[serde(default)]
    pub history_limit: usize,

    /// Semantic hits merged into the history when the memory supports it
    #[serde(default = "default_semantic_recall_limit")]
    pub semantic_recall_limit: usize,
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_system_prompt() -> String {
    "You are a helpful assistant. Use the available tools when they help you answer accurately.".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_iterations() -> u32 {
    10
}
fn default_max_cot_steps() -> u32 {
    5
}
fn default_reflection_threshold() -> f64 {
    0.7
}
fn default_max_verification_steps() -> u32 {
    3
}
fn default_semantic_recall_limit() -> usize {
    5
}
fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            system_prompt: default_system_prompt(),
            temperature: default_temperature(),
            max_tokens: None,
            max_iterations: default_max_iterations(),
            max_cot_steps: default_max_cot_steps(),
            reflection_enabled: true,
            reflection_threshold: default_reflection_threshold(),
            max_verification_steps: default_max_verification_steps(),
            history_limit: 0,
            semantic_recall_limit: default_semantic_recall_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Capacity of the recency buffer
    #[serde(default = "default_recency_capacity")]
    pub recency_capacity: usize,

    #[serde(default = "default_true")]
    pub semantic_enabled: bool,

    /// Multiplier for semantic hits younger than one hour
    #[serde(default = "default_hour_boost")]
    pub hour_boost: f32,

    /// Multiplier for semantic hits younger than one day
    #[serde(default = "default_day_boost")]
    pub day_boost: f32,

    /// SQLite file backing the vector store; in-memory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<String>,

    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,

    /// Raw similarity a semantic hit needs before it joins the prompt context
    #[serde(default = "default_recall_min_similarity")]
    pub recall_min_similarity: f32,
}

pub const DEFAULT_RECALL_MIN_SIMILARITY: f32 = 0.3;

fn default_recency_capacity() -> usize {
    100
}
fn default_hour_boost() -> f32 {
    1.2
}
fn default_day_boost() -> f32 {
    1.1
}
fn default_embedding_dimensions() -> usize {
    256
}
fn default_recall_min_similarity() -> f32 {
    DEFAULT_RECALL_MIN_SIMILARITY
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            recency_capacity: default_recency_capacity(),
            semantic_enabled: true,
            hour_boost: default_hour_boost(),
            day_boost: default_day_boost(),
            sqlite_path: None,
            embedding_dimensions: default_embedding_dimensions(),
            recall_min_similarity: default_recall_min_similarity(),
        }
    }
}

/// What the experience recorder does when its queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// The submitter waits for space
    Block,
    /// Evict the oldest queued record
    DropOldest,
    /// Reject the incoming record
    #[default]
    DropNewest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Exploration probability of the tool selector
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// Calls a tool needs before it can be exploited
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: usize,

    #[serde(default = "default_success_weight")]
    pub success_weight: f64,

    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,

    /// Minimum similarity for two failures to share a cluster
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,

    #[serde(default = "default_max_failures_analyzed")]
    pub max_failures_analyzed: usize,

    #[serde(default = "default_pattern_ttl_secs")]
    pub pattern_ttl_secs: u64,

    /// Acceptance threshold when matching a failure to a cached pattern
    #[serde(default = "default_min_pattern_confidence")]
    pub min_pattern_confidence: f64,

    /// Experiences scanned when computing tool statistics
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,

    #[serde(default = "default_recorder_capacity")]
    pub recorder_capacity: usize,

    #[serde(default = "default_recorder_workers")]
    pub recorder_workers: usize,

    #[serde(default)]
    pub backpressure: BackpressurePolicy,

    /// Fallback tool per intent name, used when nothing has been learned yet
    #[serde(default = "default_tools")]
    pub default_tools: HashMap<String, String>,
}

fn default_epsilon() -> f64 {
    0.10
}
fn default_min_sample_size() -> usize {
    3
}
fn default_success_weight() -> f64 {
    0.7
}
fn default_latency_weight() -> f64 {
    0.3
}
fn default_similarity_threshold() -> f32 {
    0.75
}
fn default_min_cluster_size() -> usize {
    3
}
fn default_max_failures_analyzed() -> usize {
    500
}
fn default_pattern_ttl_secs() -> u64 {
    300
}
fn default_min_pattern_confidence() -> f64 {
    0.6
}
fn default_stats_window() -> usize {
    1000
}
fn default_recorder_capacity() -> usize {
    256
}
fn default_recorder_workers() -> usize {
    2
}
fn default_tools() -> HashMap<String, String> {
    [
        (Intent::Calculation, "calculator"),
        (Intent::InformationRetrieval, "web_search"),
        (Intent::FileOperation, "file_read"),
        (Intent::Datetime, "datetime"),
        (Intent::SystemInfo, "system_info"),
    ]
    .into_iter()
    .map(|(intent, tool)| (intent.as_str().to_string(), tool.to_string()))
    .collect()
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            epsilon: default_epsilon(),
            min_sample_size: default_min_sample_size(),
            success_weight: default_success_weight(),
            latency_weight: default_latency_weight(),
            similarity_threshold: default_similarity_threshold(),
            min_cluster_size: default_min_cluster_size(),
            max_failures_analyzed: default_max_failures_analyzed(),
            pattern_ttl_secs: default_pattern_ttl_secs(),
            min_pattern_confidence: default_min_pattern_confidence(),
            stats_window: default_stats_window(),
            recorder_capacity: default_recorder_capacity(),
            recorder_workers: default_recorder_workers(),
            backpressure: BackpressurePolicy::default(),
            default_tools: default_tools(),
        }
    }
}

impl LearningConfig {
    /// The configured fallback tool for an intent.
    pub fn default_tool_for(&self, intent: Intent) -> Option<&str> {
        self.default_tools.get(intent.as_str()).map(String::as_str)
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.kestrel/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `KESTREL_MODEL`
    /// - `KESTREL_LOG`
    /// - `KESTREL_EPSILON`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(model) = std::env::var("KESTREL_MODEL") {
            self.agent.model = model;
        }
        if let Ok(level) = std::env::var("KESTREL_LOG") {
            self.logging.level = level;
        }
        if let Ok(raw) = std::env::var("KESTREL_EPSILON") {
            self.learning.epsilon = raw.parse().map_err(|_| {
                ConfigError::ValidationError(format!("KESTREL_EPSILON is not a number: {raw}"))
            })?;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".kestrel")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let agent = &self.agent;
        if !(0.0..=2.0).contains(&agent.temperature) {
            return Err(ConfigError::ValidationError(
                "agent.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }
        if agent.max_cot_steps == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_cot_steps must be at least 1".into(),
            ));
        }
        check_unit("agent.reflection_threshold", agent.reflection_threshold)?;

        let memory = &self.memory;
        if memory.recency_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "memory.recency_capacity must be at least 1".into(),
            ));
        }
        if memory.embedding_dimensions == 0 {
            return Err(ConfigError::ValidationError(
                "memory.embedding_dimensions must be at least 1".into(),
            ));
        }
        if memory.hour_boost < 1.0 || memory.day_boost < 1.0 || memory.day_boost > memory.hour_boost {
            return Err(ConfigError::ValidationError(
                "memory boosts must satisfy hour_boost >= day_boost >= 1.0".into(),
            ));
        }
        check_unit("memory.recall_min_similarity", memory.recall_min_similarity as f64)?;

        let learning = &self.learning;
        check_unit("learning.epsilon", learning.epsilon)?;
        check_unit("learning.similarity_threshold", learning.similarity_threshold as f64)?;
        check_unit("learning.min_pattern_confidence", learning.min_pattern_confidence)?;
        if learning.success_weight < 0.0
            || learning.latency_weight < 0.0
            || learning.success_weight + learning.latency_weight <= 0.0
        {
            return Err(ConfigError::ValidationError(
                "learning weights must be non-negative with a positive sum".into(),
            ));
        }
        if learning.min_sample_size == 0 || learning.min_cluster_size == 0 {
            return Err(ConfigError::ValidationError(
                "learning.min_sample_size and learning.min_cluster_size must be at least 1".into(),
            ));
        }
        if learning.recorder_capacity == 0 || learning.recorder_workers == 0 {
            return Err(ConfigError::ValidationError(
                "learning.recorder_capacity and learning.recorder_workers must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

fn check_unit(name: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "{name} must be between 0.0 and 1.0"
        )))
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for kestrel_core::Error {
    fn from(err: ConfigError) -> Self {
        kestrel_core::Error::Config {
            message: err.to_string(),
        }
    }
}
