//! The conversation loop.
//!
//! One `chat` call:
//!
//! 1. appends the user turn to memory and reads back the (contextual) history
//! 2. routes the query to a strategy and detects its intent
//! 3. runs the strategy: simple, ReAct tool use, or chain-of-thought
//! 4. optionally reflects on the answer and applies a correction
//! 5. persists the new turns
//! 6. hands an [`Experience`] to the background recorder
//!
//! Cancellation aborts at the next external await and nothing is recorded.
//! Learning failures are logged and never reach the caller.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use kestrel_config::{AgentConfig, AppConfig, LearningConfig};
use kestrel_core::error::{Error, Result};
use kestrel_core::event::{DomainEvent, EventBus};
use kestrel_core::experience::{Experience, Intent, ReasoningMode};
use kestrel_core::memory::ConversationMemory;
use kestrel_core::message::{ConversationId, Message, MessageToolCall, Role};
use kestrel_core::provider::Provider;
use kestrel_core::tool::ToolRegistry;
use kestrel_core::vector::Embedder;
use kestrel_learning::{
    ErrorPattern, ExperienceStore, LearningReport, LearningSystem, ToolRecommendation, ToolStats,
};
use kestrel_memory::{open_vector_store, DualTierMemory, HashingEmbedder, RecencyBoost};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::WorkingMemory;
use crate::engine::{Engine, EngineSettings, TurnContext};
use crate::patterns::{ChainOfThought, ReactAgent, ReactAttempt, ReactResult, ReflectionOutcome, Reflector};
use crate::router::{HeuristicClassifier, QueryClassifier};
use crate::stream_event::AgentStreamEvent;

/// Confidence recorded for answers that were not reflected on.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

const STREAM_BUFFER: usize = 128;

/// The agent: strategies, memory, and learning behind one `chat` call.
pub struct Agent {
    engine: Arc<Engine>,
    memory: Arc<dyn ConversationMemory>,
    classifier: Arc<dyn QueryClassifier>,
    react: ReactAgent,
    cot: ChainOfThought,
    reflector: Option<Reflector>,
    learning: Option<Arc<LearningSystem>>,
    config: AgentConfig,
    conversation_id: RwLock<ConversationId>,
}

/// What a strategy produced before reflection.
struct StrategyRun {
    answer: String,
    strategy: ReasoningMode,
    transcript: Vec<Message>,
    working_memory: WorkingMemory,
    iterations: usize,
    tool_calls_made: usize,
}

impl StrategyRun {
    fn from_react(result: ReactResult, strategy: ReasoningMode) -> Self {
        Self {
            answer: result.answer,
            strategy,
            transcript: result.transcript,
            working_memory: result.working_memory,
            iterations: result.iterations,
            tool_calls_made: result.tool_calls_made,
        }
    }

    /// Continue an abandoned run with the one that replaced it.
    fn then(mut self, next: StrategyRun) -> Self {
        self.transcript.extend(next.transcript);
        self.working_memory.absorb(next.working_memory);
        Self {
            answer: next.answer,
            strategy: next.strategy,
            transcript: self.transcript,
            working_memory: self.working_memory,
            iterations: self.iterations + next.iterations,
            tool_calls_made: self.tool_calls_made + next.tool_calls_made,
        }
    }

    /// Last tool call of the most recent assistant turn that made any.
    fn tool_used(&self) -> Option<&MessageToolCall> {
        self.transcript
            .iter()
            .rev()
            .find(|m| m.has_tool_calls())
            .and_then(|m| m.tool_calls.last())
    }
}

/// A completed call, ready to be recorded.
struct Answered {
    answer: String,
    strategy: ReasoningMode,
    iterations: usize,
    tool_calls_made: usize,
    tool: Option<(String, Option<serde_json::Value>)>,
    /// Output of the recorded tool's last run, when that run failed
    tool_failure: Option<String>,
    reflection: Option<ReflectionOutcome>,
}

impl Agent {
    /// Create an agent over explicit collaborators.
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        memory: Arc<dyn ConversationMemory>,
        event_bus: Arc<EventBus>,
        config: &AgentConfig,
    ) -> Self {
        let engine = Arc::new(Engine::new(
            provider,
            tools,
            event_bus,
            EngineSettings::from(config),
        ));
        let reflector = config.reflection_enabled.then(|| {
            Reflector::new(
                engine.clone(),
                config.reflection_threshold,
                config.max_verification_steps,
            )
        });

        Self {
            react: ReactAgent::new(engine.clone(), config.max_iterations),
            cot: ChainOfThought::new(engine.clone(), config.max_cot_steps),
            reflector,
            engine,
            memory,
            classifier: Arc::new(HeuristicClassifier::new()),
            learning: None,
            config: config.clone(),
            conversation_id: RwLock::new(ConversationId::new()),
        }
    }

    /// Wire memory, the experience store, and learning from configuration.
    ///
    /// Turns and experiences share one vector store: SQLite when
    /// `memory.sqlite_path` is set, otherwise process-local.
    pub async fn from_config(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        event_bus: Arc<EventBus>,
    ) -> Result<Self> {
        config.validate().map_err(|e| Error::Config {
            message: e.to_string(),
        })?;
        let store = open_vector_store(&config.memory).await?;
        let embedder: Arc<dyn Embedder> =
            Arc::new(HashingEmbedder::new(config.memory.embedding_dimensions));

        let memory = DualTierMemory::from_config(&config.memory, embedder.clone(), store.clone());
        let experiences =
            ExperienceStore::open(embedder, store, RecencyBoost::from(&config.memory));
        let tool_names = tools.names().into_iter().map(String::from).collect();
        let learning = LearningSystem::new(
            &config.learning,
            experiences,
            tool_names,
            Some(event_bus.clone()),
        )?;

        info!(
            model = %config.agent.model,
            tools = tools.len(),
            semantic = config.memory.semantic_enabled,
            learning = config.learning.enabled,
            "Agent configured"
        );

        Ok(Self::new(provider, tools, Arc::new(memory), event_bus, &config.agent)
            .with_learning(Arc::new(learning)))
    }

    /// Replace the heuristic router.
    pub fn with_classifier(mut self, classifier: Arc<dyn QueryClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Attach the learning subsystem.
    pub fn with_learning(mut self, learning: Arc<LearningSystem>) -> Self {
        self.learning = Some(learning);
        self
    }

    pub fn with_conversation_id(mut self, id: ConversationId) -> Self {
        self.conversation_id = RwLock::new(id);
        self
    }

    pub fn memory(&self) -> &Arc<dyn ConversationMemory> {
        &self.memory
    }

    pub fn learning(&self) -> Option<&Arc<LearningSystem>> {
        self.learning.as_ref()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub async fn conversation_id(&self) -> ConversationId {
        self.conversation_id.read().await.clone()
    }

    // ── Conversation ──

    /// Answer one message.
    pub async fn chat(&self, message: &str) -> Result<String> {
        self.chat_with(message, CancellationToken::new()).await
    }

    /// Answer one message, aborting when `cancel` fires.
    pub async fn chat_with(&self, message: &str, cancel: CancellationToken) -> Result<String> {
        let turn = TurnContext::new(self.conversation_id().await.to_string(), cancel);
        self.run_turn(message, &turn).await.map(|answered| answered.answer)
    }

    /// Streaming variant of [`chat_with`](Self::chat_with).
    ///
    /// Runs the same turn on a background task and reports progress on the
    /// returned receiver. The stream ends with exactly one `done` or `error`.
    pub async fn chat_stream(
        self: &Arc<Self>,
        message: impl Into<String>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<AgentStreamEvent> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let agent = Arc::clone(self);
        let message = message.into();
        let conversation_id = self.conversation_id().await.to_string();

        tokio::spawn(async move {
            let turn = TurnContext::new(conversation_id.clone(), cancel).with_events(tx.clone());
            let last = match agent.run_turn(&message, &turn).await {
                Ok(answered) => AgentStreamEvent::Done {
                    conversation_id,
                    iterations: answered.iterations,
                    tool_calls_made: answered.tool_calls_made,
                    strategy: answered.strategy.to_string(),
                },
                Err(e) => AgentStreamEvent::Error {
                    message: e.to_string(),
                },
            };
            let _ = tx.send(last).await;
        });

        rx
    }

    /// The last `limit` turns; `0` returns everything buffered.
    pub async fn history(&self, limit: usize) -> Result<Vec<Message>> {
        Ok(self.memory.history(limit).await?)
    }

    /// Clear the conversation and start a new one.
    pub async fn reset(&self) -> Result<()> {
        self.memory.clear().await?;
        let mut id = self.conversation_id.write().await;
        *id = ConversationId::new();
        info!(conversation_id = %*id, "Conversation reset");
        Ok(())
    }

    // ── Learning ──

    /// Recommend a tool. Without `intent` the router's detection is used.
    pub async fn tool_recommendation(
        &self,
        query: &str,
        intent: Option<Intent>,
    ) -> Result<Option<ToolRecommendation>> {
        let Some(learning) = &self.learning else {
            return Ok(None);
        };
        let intent = intent.unwrap_or_else(|| self.classifier.detect_intent(query));
        Ok(learning.recommend(query, intent).await?)
    }

    pub async fn tool_stats(&self, tool: &str, intent: Intent) -> Result<Option<ToolStats>> {
        let Some(learning) = &self.learning else {
            return Ok(None);
        };
        Ok(learning.tool_stats(tool, intent).await?)
    }

    pub async fn learning_report(&self) -> Result<LearningReport> {
        match &self.learning {
            Some(learning) => Ok(learning.report().await?),
            None => Ok(LearningReport::build(
                &[],
                false,
                LearningConfig::default().min_sample_size,
            )),
        }
    }

    pub async fn detect_patterns(&self) -> Result<Vec<ErrorPattern>> {
        match &self.learning {
            Some(learning) => Ok(learning.detect_patterns().await?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn suggest_correction(&self, query: &str, error: &str) -> Result<Option<ErrorPattern>> {
        match &self.learning {
            Some(learning) => Ok(Some(learning.suggest_correction(query, error).await?)),
            None => Ok(None),
        }
    }

    /// Wait until every queued experience has been written.
    pub async fn flush_learning(&self) {
        if let Some(learning) = &self.learning {
            learning.flush().await;
        }
    }

    // ── Turn internals ──

    async fn run_turn(&self, message: &str, turn: &TurnContext) -> Result<Answered> {
        let started = Instant::now();
        let conversation_id = ConversationId::from(turn.conversation_id());
        let intent = self.classifier.detect_intent(message);
        let mode = self.classifier.route(message, self.engine.has_tools());

        info!(
            conversation_id = %conversation_id,
            strategy = %mode,
            intent = %intent,
            streaming = turn.is_streaming(),
            "Handling message"
        );

        let outcome = self.answer(message, mode, intent, turn).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(answered) => {
                self.engine.event_bus().publish(DomainEvent::ResponseGenerated {
                    conversation_id: conversation_id.to_string(),
                    strategy: answered.strategy.to_string(),
                    latency_ms,
                    timestamp: Utc::now(),
                });
                self.record(Self::experience(message, intent, &answered, latency_ms, &conversation_id))
                    .await;
                Ok(answered)
            }
            Err(e) if e.is_cancelled() => {
                info!(conversation_id = %conversation_id, "Call cancelled; no experience recorded");
                Err(e)
            }
            Err(e) => {
                warn!(conversation_id = %conversation_id, strategy = %mode, error = %e, "Call failed");
                let experience = Experience::failed(message, e.to_string(), intent, mode, &conversation_id)
                    .with_latency(latency_ms)
                    .with_confidence(0.0);
                self.record(experience).await;
                Err(e)
            }
        }
    }

    async fn answer(
        &self,
        message: &str,
        mode: ReasoningMode,
        intent: Intent,
        turn: &TurnContext,
    ) -> Result<Answered> {
        let user_turn = Message::user(message)
            .with_metadata("strategy", mode.as_str())
            .with_metadata("intent", intent.as_str());
        turn.guard(self.memory.add(user_turn)).await??;

        let mut context = self.context(message, turn).await?;

        let run = match mode {
            ReasoningMode::Simple => self
                .react
                .run_direct(&context, turn)
                .await
                .map(|r| StrategyRun::from_react(r, ReasoningMode::Simple))?,
            ReasoningMode::ToolUse => {
                if let Some(hint) = self.tool_hint(message, intent, turn).await? {
                    context.push(Message::system(hint));
                }
                match self.react.attempt(&context, turn).await? {
                    ReactAttempt::Answered(result) => StrategyRun::from_react(result, ReasoningMode::ToolUse),
                    ReactAttempt::Abandoned { reason, partial } => {
                        warn!(
                            %reason,
                            tool_calls = partial.tool_calls_made,
                            "ReAct failed; falling back to simple over its tool turns"
                        );
                        let mut extended = context.clone();
                        extended.extend(partial.transcript.iter().cloned());
                        let fallback = self.simple(&extended, turn).await?;
                        StrategyRun::from_react(partial, ReasoningMode::Simple).then(fallback)
                    }
                }
            }
            ReasoningMode::ChainOfThought => match self.cot.run(&context, turn).await {
                Ok(result) => {
                    turn.emit(AgentStreamEvent::Chunk {
                        content: result.answer.clone(),
                    })
                    .await;
                    StrategyRun {
                        answer: result.answer,
                        strategy: ReasoningMode::ChainOfThought,
                        transcript: Vec::new(),
                        iterations: result.working_memory.iterations,
                        working_memory: result.working_memory,
                        tool_calls_made: 0,
                    }
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Chain-of-thought failed; falling back to simple");
                    self.simple(&context, turn).await?
                }
            },
        };

        // Tool outcome comes from the strategy, before any verification runs
        let tool = run.tool_used().map(|call| {
            (
                call.name.clone(),
                serde_json::from_str::<serde_json::Value>(&call.arguments).ok(),
            )
        });
        let tool_failure = tool.as_ref().and_then(|(name, _)| {
            run.working_memory
                .last_result_for(name)
                .filter(|r| !r.success)
                .map(|r| r.output_summary.clone())
        });

        let StrategyRun {
            answer: provisional,
            strategy,
            transcript,
            mut working_memory,
            iterations,
            tool_calls_made,
        } = run;

        let reflection = self.reflect(message, &provisional, turn, &mut working_memory).await?;
        let correction = reflection.as_ref().and_then(|r| r.corrected_answer.clone());

        for step in transcript {
            turn.guard(self.memory.add(step)).await??;
        }

        let answer = match correction {
            Some(corrected) => {
                let confidence = reflection.as_ref().map_or(0.0, |r| r.confidence);
                info!(confidence, "Answer corrected after reflection");
                turn.guard(self.memory.add(Message::correction_marker(&provisional, confidence)))
                    .await??;
                self.engine.event_bus().publish(DomainEvent::AnswerCorrected {
                    conversation_id: turn.conversation_id().to_string(),
                    confidence,
                    timestamp: Utc::now(),
                });
                turn.emit(AgentStreamEvent::Correction {
                    original: provisional,
                    corrected: corrected.clone(),
                    confidence,
                })
                .await;
                corrected
            }
            None => provisional,
        };

        let reply = Message::assistant(&answer).with_metadata("strategy", strategy.as_str());
        turn.guard(self.memory.add(reply)).await??;

        debug!(summary = %working_memory.summarize(), "Turn complete");

        Ok(Answered {
            answer,
            strategy,
            iterations,
            tool_calls_made,
            tool,
            tool_failure,
            reflection,
        })
    }

    async fn simple(&self, context: &[Message], turn: &TurnContext) -> Result<StrategyRun> {
        let result = self.react.run_direct(context, turn).await?;
        Ok(StrategyRun::from_react(result, ReasoningMode::Simple))
    }

    /// Recent history, merged with semantic recall when the memory offers it.
    async fn context(&self, message: &str, turn: &TurnContext) -> Result<Vec<Message>> {
        let limit = self.config.history_limit;
        if let Some(semantic) = self.memory.semantic()
            && self.config.semantic_recall_limit > 0
        {
            match turn
                .guard(semantic.contextual_history(message, limit, self.config.semantic_recall_limit))
                .await?
            {
                Ok(history) => return Ok(without_orphan_tool_turns(history)),
                Err(e) => warn!(error = %e, "Contextual recall failed; using recent history"),
            }
        }
        let history = turn.guard(self.memory.history(limit)).await??;
        Ok(without_orphan_tool_turns(history))
    }

    /// A system note naming the tool the selector prefers, if any.
    async fn tool_hint(&self, message: &str, intent: Intent, turn: &TurnContext) -> Result<Option<String>> {
        let Some(learning) = &self.learning else {
            return Ok(None);
        };
        match turn.guard(learning.recommend(message, intent)).await? {
            Ok(Some(rec)) if self.engine.tools().get(&rec.tool_name).is_some() => {
                debug!(
                    tool = %rec.tool_name,
                    strategy = ?rec.decision_strategy,
                    exploration = rec.is_exploration,
                    "Tool recommendation"
                );
                Ok(Some(format!(
                    "Suggested tool for this {intent} request: {} ({})",
                    rec.tool_name, rec.reasoning
                )))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(error = %e, "Tool recommendation unavailable");
                Ok(None)
            }
        }
    }

    /// Run reflection when enabled. Only cancellation escapes.
    async fn reflect(
        &self,
        question: &str,
        answer: &str,
        turn: &TurnContext,
        wm: &mut WorkingMemory,
    ) -> Result<Option<ReflectionOutcome>> {
        let Some(reflector) = &self.reflector else {
            return Ok(None);
        };
        if answer.trim().is_empty() {
            return Ok(None);
        }

        let mut scratch = WorkingMemory::new(reflector_rounds(&self.config));
        let outcome = match reflector.reflect(question, answer, turn, &mut scratch).await {
            Ok(outcome) => Some(outcome),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Reflection failed; keeping the unreflected answer");
                None
            }
        };
        wm.absorb(scratch);
        Ok(outcome)
    }

    fn experience(
        query: &str,
        intent: Intent,
        answered: &Answered,
        latency_ms: u64,
        conversation_id: &ConversationId,
    ) -> Experience {
        let mut experience = match &answered.tool_failure {
            Some(error) => {
                let mut exp = Experience::failed(query, error, intent, answered.strategy, conversation_id);
                exp.response = answered.answer.clone();
                exp
            }
            None => Experience::succeeded(query, &answered.answer, intent, answered.strategy, conversation_id),
        };

        if let Some((tool, arguments)) = &answered.tool {
            experience = experience.with_tool(tool, arguments.clone());
        }

        let confidence = answered
            .reflection
            .as_ref()
            .map_or(DEFAULT_CONFIDENCE, |r| r.confidence);
        let corrected = answered
            .reflection
            .as_ref()
            .is_some_and(ReflectionOutcome::was_corrected);

        experience
            .with_latency(latency_ms)
            .with_confidence(confidence)
            .with_reflection(answered.reflection.is_some(), corrected)
    }

    async fn record(&self, experience: Experience) {
        let Some(learning) = &self.learning else {
            return;
        };
        let id = experience.id.clone();
        match learning.record(experience).await {
            Ok(true) => debug!(experience_id = %id, "Experience queued"),
            Ok(false) => debug!(experience_id = %id, "Experience not recorded"),
            Err(e) => warn!(experience_id = %id, error = %e, "Experience recording failed; learning degraded"),
        }
    }
}

/// Drop tool results whose assistant tool-call turn fell outside the window.
/// Providers reject a tool message with no matching call before it.
fn without_orphan_tool_turns(turns: Vec<Message>) -> Vec<Message> {
    let mut calls: HashSet<String> = HashSet::new();
    let before = turns.len();
    let kept: Vec<Message> = turns
        .into_iter()
        .filter(|turn| match turn.role {
            Role::Assistant => {
                calls.extend(turn.tool_calls.iter().map(|call| call.id.clone()));
                true
            }
            Role::Tool => turn.tool_call_id.as_ref().is_some_and(|id| calls.contains(id)),
            _ => true,
        })
        .collect();
    if kept.len() < before {
        debug!(dropped = before - kept.len(), "Orphaned tool turns left out of context");
    }
    kept
}

fn reflector_rounds(config: &AgentConfig) -> usize {
    config.max_verification_steps as usize + 1
}
