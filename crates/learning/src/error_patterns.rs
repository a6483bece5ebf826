//! Clustering of failed experiences into explainable error patterns.
//!
//! Each unclustered failure seeds a similarity query against the other
//! failures; the seed plus its unclaimed neighbours form a cluster. Clusters
//! below the minimum size are discarded, the rest are summarized into
//! [`ErrorPattern`]s with a correction mined from similar successes.
//! Results are cached for a fixed TTL.

use chrono::{DateTime, Utc};
use kestrel_config::LearningConfig;
use kestrel_core::error::LearningError;
use kestrel_core::experience::{Experience, Intent};
use kestrel_memory::tokenize;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::experience_store::{ExperienceQuery, ExperienceStore};

/// Confidence given to corrections derived from a single failure.
pub const AD_HOC_CONFIDENCE: f64 = 0.3;

const TOP_N: usize = 3;
const MAX_ERROR_MESSAGES: usize = 5;
const MAX_KEYWORDS: usize = 8;
const SUCCESS_SAMPLE: usize = 20;

/// Coarse classification of an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    DivisionByZero,
    Timeout,
    NotFound,
    PermissionDenied,
    InvalidArguments,
    Network,
    Parse,
    RateLimited,
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::DivisionByZero => "division_by_zero",
            ErrorType::Timeout => "timeout",
            ErrorType::NotFound => "not_found",
            ErrorType::PermissionDenied => "permission_denied",
            ErrorType::InvalidArguments => "invalid_arguments",
            ErrorType::Network => "network",
            ErrorType::Parse => "parse",
            ErrorType::RateLimited => "rate_limited",
            ErrorType::Unknown => "unknown",
        }
    }

    fn advice(&self) -> &'static str {
        match self {
            ErrorType::DivisionByZero => "Check divisors before evaluating and explain undefined results",
            ErrorType::Timeout => "Retry with a smaller request or a faster tool",
            ErrorType::NotFound => "Verify the resource name or path before calling the tool",
            ErrorType::PermissionDenied => "Ask for access or use a resource the agent can read",
            ErrorType::InvalidArguments => "Validate arguments against the tool schema before calling",
            ErrorType::Network => "Retry later or answer from memory when the network is down",
            ErrorType::Parse => "Normalize the input format before passing it to the tool",
            ErrorType::RateLimited => "Back off before retrying the provider",
            ErrorType::Unknown => "Review the failing requests and consider a different tool",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error message by keyword.
pub fn classify_error(message: &str) -> ErrorType {
    let m = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| m.contains(n));

    if has(&["division by zero", "divide by zero", "divided by zero"]) {
        ErrorType::DivisionByZero
    } else if has(&["rate limit", "too many requests", "429"]) {
        ErrorType::RateLimited
    } else if has(&["timed out", "timeout", "deadline exceeded"]) {
        ErrorType::Timeout
    } else if has(&["permission denied", "forbidden", "unauthorized", "access denied"]) {
        ErrorType::PermissionDenied
    } else if has(&["not found", "no such", "does not exist", "404"]) {
        ErrorType::NotFound
    } else if has(&["invalid argument", "invalid tool argument", "missing argument", "invalid parameter"]) {
        ErrorType::InvalidArguments
    } else if has(&["connection", "network", "dns", "unreachable"]) {
        ErrorType::Network
    } else if has(&["parse", "syntax", "malformed", "unexpected token", "invalid json"]) {
        ErrorType::Parse
    } else {
        ErrorType::Unknown
    }
}

/// A group of similar failures, before summarization.
#[derive(Debug, Clone)]
pub struct ErrorCluster {
    pub members: Vec<Experience>,
    /// Average of the dominant error-type share and the dominant-tool share
    pub similarity: f64,
}

impl ErrorCluster {
    pub fn new(members: Vec<Experience>) -> Self {
        let similarity = cluster_similarity(&members);
        Self { members, similarity }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// A named cluster of similar failures with a suggested correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub id: String,
    pub description: String,
    pub error_type: ErrorType,
    pub frequency: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub failed_tools: Vec<String>,
    pub common_intents: Vec<Intent>,
    /// Most frequent query tokens, used to match new failures
    pub keywords: Vec<String>,
    /// Representative error messages
    pub error_messages: Vec<String>,
    pub correction: String,
    pub best_tool: Option<String>,
    pub confidence: f64,
    pub experience_ids: Vec<String>,
}

/// Tunables of the analyzer.
#[derive(Debug, Clone)]
pub struct PatternSettings {
    pub similarity_threshold: f32,
    pub min_cluster_size: usize,
    pub max_failures_analyzed: usize,
    pub ttl: Duration,
    pub min_pattern_confidence: f64,
}

impl From<&LearningConfig> for PatternSettings {
    fn from(config: &LearningConfig) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            min_cluster_size: config.min_cluster_size,
            max_failures_analyzed: config.max_failures_analyzed,
            ttl: Duration::from_secs(config.pattern_ttl_secs),
            min_pattern_confidence: config.min_pattern_confidence,
        }
    }
}

impl Default for PatternSettings {
    fn default() -> Self {
        Self::from(&LearningConfig::default())
    }
}

struct CachedPatterns {
    computed_at: Instant,
    patterns: Vec<ErrorPattern>,
}

pub struct ErrorPatternAnalyzer {
    store: Arc<ExperienceStore>,
    settings: PatternSettings,
    cache: RwLock<Option<CachedPatterns>>,
}

impl ErrorPatternAnalyzer {
    pub fn new(store: Arc<ExperienceStore>, settings: PatternSettings) -> Self {
        Self {
            store,
            settings,
            cache: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &PatternSettings {
        &self.settings
    }

    /// Cached patterns, recomputed when older than the TTL.
    pub async fn detect_patterns(&self) -> Result<Vec<ErrorPattern>, LearningError> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            if cached.computed_at.elapsed() < self.settings.ttl {
                return Ok(cached.patterns.clone());
            }
        }
        self.refresh_patterns().await
    }

    /// Recompute patterns regardless of cache age.
    pub async fn refresh_patterns(&self) -> Result<Vec<ErrorPattern>, LearningError> {
        let clusters = self.cluster_failures().await?;
        let mut patterns = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            patterns.push(self.summarize(cluster).await?);
        }
        patterns.sort_by(|a, b| b.frequency.cmp(&a.frequency));

        info!(patterns = patterns.len(), "Error patterns recomputed");
        *self.cache.write().await = Some(CachedPatterns {
            computed_at: Instant::now(),
            patterns: patterns.clone(),
        });
        Ok(patterns)
    }

    /// Group recent failures. Clusters below the minimum size are dropped.
    pub async fn cluster_failures(&self) -> Result<Vec<ErrorCluster>, LearningError> {
        let failures = self
            .store
            .get_all_failures(self.settings.max_failures_analyzed)
            .await?;
        let analyzed: HashSet<&str> = failures.iter().map(|f| f.id.as_str()).collect();
        let mut claimed: HashSet<String> = HashSet::new();
        let mut clusters = Vec::new();

        for seed in &failures {
            if claimed.contains(&seed.id) {
                continue;
            }
            claimed.insert(seed.id.clone());

            let neighbours = self
                .store
                .query(
                    &ExperienceQuery::similar_to(
                        seed.query.as_str(),
                        self.settings.similarity_threshold,
                        self.settings.max_failures_analyzed,
                    )
                    .failures(),
                )
                .await?;

            let mut members = vec![seed.clone()];
            for n in neighbours {
                if n.id != seed.id && analyzed.contains(n.id.as_str()) && !claimed.contains(&n.id) {
                    members.push(n);
                }
            }

            if members.len() < self.settings.min_cluster_size {
                continue;
            }
            for m in &members {
                claimed.insert(m.id.clone());
            }
            debug!(seed = %seed.id, size = members.len(), "Failure cluster formed");
            clusters.push(ErrorCluster::new(members));
        }
        Ok(clusters)
    }

    async fn summarize(&self, cluster: ErrorCluster) -> Result<ErrorPattern, LearningError> {
        let members = &cluster.members;
        let size = members.len();

        let error_type = dominant(members.iter().map(|m| classify_error(&m.error)))
            .unwrap_or(ErrorType::Unknown);
        let failed_tools = top_n(members.iter().filter_map(|m| m.tool_called.clone()), TOP_N);
        let common_intents = top_n(members.iter().map(|m| m.intent), TOP_N);

        let mut error_messages: Vec<String> = Vec::new();
        for m in members {
            if error_messages.len() == MAX_ERROR_MESSAGES {
                break;
            }
            if !error_messages.contains(&m.error) {
                error_messages.push(m.error.clone());
            }
        }

        let keywords = top_n(
            members.iter().flat_map(|m| tokenize(&m.query).collect::<Vec<_>>()),
            MAX_KEYWORDS,
        );

        let (best_tool, correction) = self.correction_for(&members[0].query, error_type).await?;
        let first_seen = members.iter().map(|m| m.timestamp).min().unwrap_or_else(Utc::now);
        let last_seen = members.iter().map(|m| m.timestamp).max().unwrap_or_else(Utc::now);

        let tool_label = failed_tools.first().map(String::as_str).unwrap_or("no tool");
        let confidence = 0.6 * (size as f64 / 10.0).min(1.0) + 0.4 * cluster.similarity;

        Ok(ErrorPattern {
            id: uuid::Uuid::new_v4().to_string(),
            description: format!("{size} {error_type} failures involving {tool_label}"),
            error_type,
            frequency: size,
            first_seen,
            last_seen,
            failed_tools,
            common_intents,
            keywords,
            error_messages,
            correction,
            best_tool,
            confidence: confidence.clamp(0.0, 1.0),
            experience_ids: members.iter().map(|m| m.id.clone()).collect(),
        })
    }

    /// Most frequently successful tool among successes similar to `query`.
    async fn correction_for(
        &self,
        query: &str,
        error_type: ErrorType,
    ) -> Result<(Option<String>, String), LearningError> {
        let successes = self
            .store
            .query(
                &ExperienceQuery::similar_to(query, self.settings.similarity_threshold, SUCCESS_SAMPLE)
                    .successes(),
            )
            .await?;
        let best = dominant(successes.iter().filter_map(|s| s.tool_called.clone()));

        Ok(match best {
            Some(tool) => {
                let wins = successes
                    .iter()
                    .filter(|s| s.tool_called.as_deref() == Some(tool.as_str()))
                    .count();
                let text = format!("Use {tool}: it succeeded on {wins} similar requests");
                (Some(tool), text)
            }
            None => (None, error_type.advice().to_string()),
        })
    }

    /// Match a new failure against cached patterns.
    ///
    /// Score = 0.5 × keyword overlap + 0.5 × error match. Below the acceptance
    /// threshold, an ad-hoc pattern for this single failure is returned with
    /// confidence [`AD_HOC_CONFIDENCE`].
    pub async fn suggest_correction(&self, query: &str, error_message: &str) -> Result<ErrorPattern, LearningError> {
        let patterns = self.detect_patterns().await?;
        let tokens: HashSet<String> = tokenize(query).collect();
        let error_type = classify_error(error_message);

        let best = patterns
            .iter()
            .map(|p| (match_score(p, &tokens, error_message, error_type), p))
            .filter(|(score, _)| *score >= self.settings.min_pattern_confidence)
            .max_by(|a, b| a.0.total_cmp(&b.0));

        if let Some((score, pattern)) = best {
            debug!(pattern = %pattern.id, score, "Failure matched cached pattern");
            return Ok(pattern.clone());
        }

        let (best_tool, correction) = self.correction_for(query, error_type).await?;
        let now = Utc::now();
        Ok(ErrorPattern {
            id: uuid::Uuid::new_v4().to_string(),
            description: format!("Unclustered {error_type} failure"),
            error_type,
            frequency: 1,
            first_seen: now,
            last_seen: now,
            failed_tools: Vec::new(),
            common_intents: Vec::new(),
            keywords: tokens.into_iter().collect(),
            error_messages: vec![error_message.to_string()],
            correction,
            best_tool,
            confidence: AD_HOC_CONFIDENCE,
            experience_ids: Vec::new(),
        })
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}

fn match_score(pattern: &ErrorPattern, tokens: &HashSet<String>, error: &str, error_type: ErrorType) -> f64 {
    let overlap = if pattern.keywords.is_empty() {
        0.0
    } else {
        pattern.keywords.iter().filter(|k| tokens.contains(*k)).count() as f64 / pattern.keywords.len() as f64
    };

    let error_lower = error.trim().to_lowercase();
    let substring = !error_lower.is_empty()
        && pattern.error_messages.iter().any(|m| {
            let m = m.to_lowercase();
            m.contains(&error_lower) || error_lower.contains(&m)
        });
    let error_match = if substring {
        1.0
    } else if error_type == pattern.error_type && error_type != ErrorType::Unknown {
        0.8
    } else {
        0.0
    };

    0.5 * overlap + 0.5 * error_match
}

fn counts<T: Eq + Hash + Ord + Clone>(items: impl Iterator<Item = T>) -> BTreeMap<T, usize> {
    let mut map = BTreeMap::new();
    for item in items {
        *map.entry(item).or_insert(0) += 1;
    }
    map
}

/// Most frequent item; ties go to the smallest.
fn dominant<T: Eq + Hash + Ord + Clone>(items: impl Iterator<Item = T>) -> Option<T> {
    top_n(items, 1).into_iter().next()
}

fn top_n<T: Eq + Hash + Ord + Clone>(items: impl Iterator<Item = T>, n: usize) -> Vec<T> {
    let mut ranked: Vec<(T, usize)> = counts(items).into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(item, _)| item).collect()
}

fn cluster_similarity(members: &[Experience]) -> f64 {
    if members.is_empty() {
        return 0.0;
    }
    let total = members.len() as f64;
    let share = |counts: HashMap<String, usize>| counts.values().copied().max().unwrap_or(0) as f64 / total;

    let mut types: HashMap<String, usize> = HashMap::new();
    let mut tools: HashMap<String, usize> = HashMap::new();
    for m in members {
        *types.entry(classify_error(&m.error).as_str().to_string()).or_default() += 1;
        *tools
            .entry(m.tool_called.clone().unwrap_or_default())
            .or_default() += 1;
    }
    (share(types) + share(tools)) / 2.0
}
