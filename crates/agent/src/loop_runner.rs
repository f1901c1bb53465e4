//! The orchestration loop: runs steps until a stop condition fires.

use futures::Stream;
use futures::stream;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use steploop_config::LoopConfig;
use steploop_core::event::{DomainEvent, EventBus};
use steploop_core::message::{ConversationId, Message};
use steploop_core::provider::{Provider, Usage};
use steploop_core::step::{FinishReason, Step, ToolCall, ToolResult};
use steploop_core::tool::ToolRegistry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::state::{RunState, RunStatus};
use crate::step::{StepContext, StepExecutor, StepSettings, step_messages};
use crate::stop::{StopCondition, StopReason, check_stop_conditions, step_count_is};
use crate::stream_event::AgentStreamEvent;

/// What `prepare_step` sees before each backend call.
pub struct PrepareStepInput<'a> {
    /// 0-based ordinal of the step about to run
    pub step_number: usize,
    pub steps: &'a [Step],
    pub messages: &'a [Message],
    /// Settings the step would use without overrides
    pub settings: &'a StepSettings,
}

/// Settings overridden for the next backend call only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOverrides {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system: Option<String>,
    pub active_tools: Option<Vec<String>>,
}

impl StepOverrides {
    pub fn apply(self, base: &StepSettings) -> StepSettings {
        StepSettings {
            model: self.model.unwrap_or_else(|| base.model.clone()),
            temperature: self.temperature.unwrap_or(base.temperature),
            max_tokens: self.max_tokens.or(base.max_tokens),
            system: self.system.or_else(|| base.system.clone()),
            active_tools: self.active_tools.or_else(|| base.active_tools.clone()),
        }
    }
}

pub type PrepareStepFn = Arc<dyn Fn(&PrepareStepInput<'_>) -> Option<StepOverrides> + Send + Sync>;
pub type StepCallback = Arc<dyn Fn(&Step) + Send + Sync>;
pub type FinishCallback = Arc<dyn Fn(&GenerateResult) + Send + Sync>;

/// Per-invocation options.
#[derive(Clone, Default)]
pub struct GenerateOptions {
    pub messages: Vec<Message>,
    /// Overrides the configured system prompt
    pub system: Option<String>,
    /// Empty means a single step
    pub stop_conditions: Vec<Arc<dyn StopCondition>>,
    pub prepare_step: Option<PrepareStepFn>,
    pub on_step_finish: Option<StepCallback>,
    pub on_finish: Option<FinishCallback>,
    pub cancel: CancellationToken,
}

impl GenerateOptions {
    /// Start from a single user prompt.
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self::messages(vec![Message::user(prompt)])
    }

    /// Start from an existing message list.
    pub fn messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn stop_when(mut self, conditions: Vec<Arc<dyn StopCondition>>) -> Self {
        self.stop_conditions = conditions;
        self
    }

    pub fn prepare_step<F>(mut self, f: F) -> Self
    where
        F: Fn(&PrepareStepInput<'_>) -> Option<StepOverrides> + Send + Sync + 'static,
    {
        self.prepare_step = Some(Arc::new(f));
        self
    }

    pub fn on_step_finish<F>(mut self, f: F) -> Self
    where
        F: Fn(&Step) + Send + Sync + 'static,
    {
        self.on_step_finish = Some(Arc::new(f));
        self
    }

    pub fn on_finish<F>(mut self, f: F) -> Self
    where
        F: Fn(&GenerateResult) + Send + Sync + 'static,
    {
        self.on_finish = Some(Arc::new(f));
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

impl fmt::Debug for GenerateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerateOptions")
            .field("messages", &self.messages.len())
            .field("system", &self.system)
            .field("stop_conditions", &self.stop_conditions)
            .field("prepare_step", &self.prepare_step.is_some())
            .finish_non_exhaustive()
    }
}

/// Aggregate outcome of a run.
///
/// `tool_calls` and `tool_results` span all steps. On failure the partial
/// transcript is kept and `error` says what went wrong.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateResult {
    pub conversation_id: String,
    /// Text of the final step
    pub text: String,
    pub steps: Vec<Step>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_error"
    )]
    pub error: Option<AgentError>,
    /// Input messages plus everything the run appended; feed back into
    /// `GenerateOptions::messages` to continue a deferred run.
    #[serde(skip)]
    pub messages: Vec<Message>,
}

fn serialize_error<S: Serializer>(error: &Option<AgentError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

impl GenerateResult {
    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }

    /// Calls of the final step left for the caller to fulfil.
    pub fn pending_tool_calls(&self) -> Vec<&ToolCall> {
        self.steps
            .last()
            .map(|s| s.pending_tool_calls().collect())
            .unwrap_or_default()
    }
}

/// A run executing on a spawned task.
pub struct StreamingRun {
    pub events: mpsc::Receiver<AgentStreamEvent>,
    pub handle: JoinHandle<GenerateResult>,
}

impl StreamingRun {
    /// Drop the event feed and wait for the aggregate.
    pub async fn result(self) -> Result<GenerateResult, tokio::task::JoinError> {
        drop(self.events);
        self.handle.await
    }
}

/// Only the text deltas of an event feed.
pub fn text_stream(events: mpsc::Receiver<AgentStreamEvent>) -> impl Stream<Item = String> {
    stream::unfold(events, |mut rx| async move {
        while let Some(event) = rx.recv().await {
            if let AgentStreamEvent::TextDelta { content, .. } = event {
                return Some((content, rx));
            }
        }
        None
    })
}

/// The loop that orchestrates backend calls and tool execution.
pub struct AgentLoop {
    executor: StepExecutor,
    config: LoopConfig,
    event_bus: Arc<EventBus>,
}

impl AgentLoop {
    pub fn new(provider: Arc<dyn Provider>, tools: Arc<ToolRegistry>, config: LoopConfig) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let executor = StepExecutor::new(provider, tools)
            .with_streaming(config.streaming)
            .with_backend_timeout(config.timeouts.backend())
            .with_tool_timeout(config.timeouts.tool())
            .with_event_bus(event_bus.clone());
        Self {
            executor,
            config,
            event_bus,
        }
    }

    /// Publish domain events on a shared bus.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.executor = self.executor.with_event_bus(bus.clone());
        self.event_bus = bus;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        self.executor.tools()
    }

    /// Run to a terminal state and return the aggregate.
    pub async fn generate(&self, options: GenerateOptions) -> GenerateResult {
        self.run(options, None).await
    }

    /// Run on a spawned task, streaming events as they happen.
    pub fn stream(self: &Arc<Self>, options: GenerateOptions) -> StreamingRun {
        let (tx, rx) = mpsc::channel(128);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(options, Some(&tx)).await });
        StreamingRun { events: rx, handle }
    }

    async fn run(
        &self,
        options: GenerateOptions,
        events: Option<&mpsc::Sender<AgentStreamEvent>>,
    ) -> GenerateResult {
        let conversation_id = ConversationId::new().to_string();
        let max_steps = self.config.max_steps;
        let conditions = if options.stop_conditions.is_empty() {
            vec![step_count_is(1)]
        } else {
            options.stop_conditions.clone()
        };
        let mut base = StepSettings::from_config(&self.config);
        if options.system.is_some() {
            base.system = options.system.clone();
        }
        let ctx = StepContext {
            cancel: &options.cancel,
            events,
        };

        let mut state = RunState::new();
        let mut messages = options.messages.clone();
        let mut stop_reason = None;
        let mut error = None;

        info!(
            conversation_id = %conversation_id,
            messages = messages.len(),
            conditions = conditions.len(),
            max_steps,
            "Starting run"
        );

        loop {
            if state.step_count() >= max_steps {
                warn!(conversation_id = %conversation_id, max_steps, "Step ceiling reached");
                stop_reason = Some(StopReason::MaxSteps { limit: max_steps });
                state.finish(RunStatus::Stopped);
                break;
            }
            if options.cancel.is_cancelled() {
                error = Some(AgentError::Cancelled);
                state.finish(RunStatus::Failed);
                break;
            }

            let settings = match &options.prepare_step {
                Some(prepare) => prepare(&PrepareStepInput {
                    step_number: state.step_count(),
                    steps: state.steps(),
                    messages: &messages,
                    settings: &base,
                })
                .map(|o| o.apply(&base))
                .unwrap_or_else(|| base.clone()),
                None => base.clone(),
            };

            let step = match self
                .executor
                .execute_step(&state, &messages, &settings, ctx)
                .await
            {
                Ok(step) => step,
                Err(e) => {
                    warn!(
                        conversation_id = %conversation_id,
                        step = state.step_count(),
                        error = %e,
                        "Run failed"
                    );
                    error = Some(e);
                    state.finish(RunStatus::Failed);
                    break;
                }
            };

            messages.extend(step_messages(&step));
            let step = match state.append(step) {
                Ok(step) => step.clone(),
                Err(e) => {
                    error = Some(e);
                    break;
                }
            };
            self.step_finished(&conversation_id, &step, ctx, &options).await;

            if options.cancel.is_cancelled() {
                error = Some(AgentError::Cancelled);
                state.finish(RunStatus::Failed);
                break;
            }
            if step.finish_reason == FinishReason::Deferred {
                let tool_name = step
                    .pending_tool_calls()
                    .next()
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                stop_reason = Some(StopReason::Deferred { tool_name });
                state.finish(RunStatus::Deferred);
                break;
            }
            if !wants_another_step(&step) {
                stop_reason = Some(StopReason::ModelFinished);
                state.finish(RunStatus::Stopped);
                break;
            }
            if let Some(reason) = check_stop_conditions(&conditions, &state) {
                stop_reason = Some(reason);
                state.finish(RunStatus::Stopped);
                break;
            }
        }

        let result = self.assemble(conversation_id, state, messages, stop_reason, error);

        self.event_bus.publish(DomainEvent::RunFinished {
            conversation_id: result.conversation_id.clone(),
            status: result.status.to_string(),
            steps: result.steps.len(),
            finish_reason: result.finish_reason,
            total_tokens: result.usage.total_tokens,
            timestamp: chrono::Utc::now(),
        });
        let terminal = match &result.error {
            Some(e) => AgentStreamEvent::Error {
                message: e.to_string(),
            },
            None => AgentStreamEvent::Done {
                conversation_id: result.conversation_id.clone(),
                status: result.status,
                finish_reason: result.finish_reason,
                usage: result.usage,
                steps: result.steps.len(),
                tool_calls_made: result.tool_calls.len(),
            },
        };
        if let Some(tx) = events {
            let _ = tx.send(terminal).await;
        }
        if let Some(on_finish) = &options.on_finish {
            on_finish(&result);
        }

        info!(
            conversation_id = %result.conversation_id,
            status = %result.status,
            steps = result.steps.len(),
            finish_reason = %result.finish_reason,
            total_tokens = result.usage.total_tokens,
            "Run finished"
        );
        result
    }

    async fn step_finished(
        &self,
        conversation_id: &str,
        step: &Step,
        ctx: StepContext<'_>,
        options: &GenerateOptions,
    ) {
        debug!(
            conversation_id,
            step = step.index,
            finish_reason = %step.finish_reason,
            tool_calls = step.tool_calls.len(),
            tool_results = step.tool_results.len(),
            "Step finished"
        );
        self.event_bus.publish(DomainEvent::StepFinished {
            conversation_id: conversation_id.to_string(),
            step: step.index,
            finish_reason: step.finish_reason,
            tool_calls: step.tool_calls.len(),
            tokens_used: step.usage.total_tokens,
            timestamp: chrono::Utc::now(),
        });
        if let Some(tx) = ctx.events {
            let _ = tx
                .send(AgentStreamEvent::StepFinish {
                    step: step.index,
                    finish_reason: step.finish_reason,
                    usage: step.usage,
                })
                .await;
        }
        if let Some(on_step_finish) = &options.on_step_finish {
            on_step_finish(step);
        }
    }

    fn assemble(
        &self,
        conversation_id: String,
        state: RunState,
        messages: Vec<Message>,
        stop_reason: Option<StopReason>,
        error: Option<AgentError>,
    ) -> GenerateResult {
        let status = state.status();
        let last = state.last_step();
        let ceiling_hit = matches!(
            stop_reason,
            Some(StopReason::MaxSteps { .. } | StopReason::StepCount { .. })
        ) && last.is_some_and(wants_another_step);

        let finish_reason = if status == RunStatus::Failed {
            FinishReason::Error
        } else if ceiling_hit {
            FinishReason::MaxSteps
        } else {
            last.map(|s| s.finish_reason).unwrap_or(FinishReason::Other)
        };

        GenerateResult {
            conversation_id,
            text: last.map(|s| s.text.clone()).unwrap_or_default(),
            tool_calls: state.tool_calls().cloned().collect(),
            tool_results: state.tool_results().cloned().collect(),
            usage: state.usage(),
            steps: state.steps().to_vec(),
            finish_reason,
            status,
            stop_reason,
            error,
            messages,
        }
    }
}

/// A step continues the run when it called tools and every call has a result.
fn wants_another_step(step: &Step) -> bool {
    !step.tool_calls.is_empty() && step.tool_results.len() == step.tool_calls.len()
}
