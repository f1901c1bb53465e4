//! Step executor: one backend round-trip plus the tool calls it requested.
//!
//! For each step the executor:
//!
//! 1. Builds a `ProviderRequest` from the transcript and the tool declarations
//! 2. Invokes the backend exactly once (single-shot or streaming)
//! 3. Resolves, validates and dispatches the requested tool calls
//! 4. Returns the finished `Step`
//!
//! Tool failures become error results inside the step. Backend failures,
//! backend timeouts and cancellation are returned as `AgentError`.

use futures::StreamExt;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use steploop_config::LoopConfig;
use steploop_core::error::{ProviderError, ToolError};
use steploop_core::event::{DomainEvent, EventBus};
use steploop_core::message::{Message, MessageToolCall};
use steploop_core::provider::{Provider, ProviderRequest, ProviderResponse, StreamEvent};
use steploop_core::step::{FinishReason, Step, ToolCall, ToolResult};
use steploop_core::tool::{ToolExecutor, ToolRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::assembler::StepAssembler;
use crate::error::AgentError;
use crate::state::RunState;
use crate::stream_event::AgentStreamEvent;

/// Request settings for a single step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// System instructions prepended to the request
    pub system: Option<String>,
    /// Restrict the declared tools to these names
    pub active_tools: Option<Vec<String>>,
}

impl StepSettings {
    pub fn from_config(config: &LoopConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            system: config.system_prompt.clone(),
            active_tools: None,
        }
    }
}

/// Per-run handles the executor needs while a step is in flight.
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    pub cancel: &'a CancellationToken,
    pub events: Option<&'a mpsc::Sender<AgentStreamEvent>>,
}

pub struct StepExecutor {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    streaming: bool,
    backend_timeout: Option<Duration>,
    tool_timeout: Option<Duration>,
    event_bus: Option<Arc<EventBus>>,
}

impl StepExecutor {
    pub fn new(provider: Arc<dyn Provider>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            provider,
            tools,
            streaming: false,
            backend_timeout: None,
            tool_timeout: None,
            event_bus: None,
        }
    }

    /// Consume the backend as an event stream.
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_backend_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.backend_timeout = timeout;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Build the backend request for the next step.
    pub fn build_request(&self, messages: &[Message], settings: &StepSettings) -> ProviderRequest {
        let mut all = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = &settings.system {
            all.push(Message::system(system));
        }
        all.extend_from_slice(messages);

        let tools = self
            .tools
            .declarations()
            .into_iter()
            .filter(|d| match &settings.active_tools {
                Some(active) => active.iter().any(|name| name == &d.name),
                None => true,
            })
            .collect();

        ProviderRequest {
            model: settings.model.clone(),
            messages: all,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            tools,
            stream: self.streaming,
            stop: vec![],
        }
    }

    /// Execute the next step of `state`.
    pub async fn execute_step(
        &self,
        state: &RunState,
        messages: &[Message],
        settings: &StepSettings,
        ctx: StepContext<'_>,
    ) -> Result<Step, AgentError> {
        let index = state.step_count();
        if ctx.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let request = self.build_request(messages, settings);
        debug!(
            step = index,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            streaming = self.streaming,
            "Invoking backend"
        );
        emit(ctx, AgentStreamEvent::StepStart { step: index }).await;

        let invocation = self.invoke(request, index, ctx);
        let timed = async {
            match self.backend_timeout {
                Some(limit) => match tokio::time::timeout(limit, invocation).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(limit.as_millis() as u64)),
                },
                None => invocation.await,
            }
        };
        let response = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
            result = timed => result?,
        };
        check_call_ids(state, &response)?;

        Ok(self.dispatch(index, response, ctx).await)
    }

    async fn invoke(
        &self,
        request: ProviderRequest,
        index: usize,
        ctx: StepContext<'_>,
    ) -> Result<ProviderResponse, ProviderError> {
        let model = request.model.clone();

        if !self.streaming {
            let response = self.provider.complete(request).await?;
            if !response.message.content.is_empty() {
                emit(
                    ctx,
                    AgentStreamEvent::TextDelta {
                        step: index,
                        content: response.message.content.clone(),
                    },
                )
                .await;
            }
            for call in &response.message.tool_calls {
                self.fire_input_start(&call.name, &call.id);
                self.fire_input_available(&call.name, &call.id, &call.arguments);
            }
            return Ok(response);
        }

        let mut stream = self.provider.stream(request).await?;
        let mut assembler = StepAssembler::new();
        let mut call_names: HashMap<String, String> = HashMap::new();

        while let Some(event) = stream.next().await {
            let event = event?;
            assembler.push(&event)?;

            match event {
                StreamEvent::TextDelta { delta, .. } => {
                    emit(
                        ctx,
                        AgentStreamEvent::TextDelta {
                            step: index,
                            content: delta,
                        },
                    )
                    .await;
                }
                StreamEvent::ToolInputStart { call_id, tool_name } => {
                    self.fire_input_start(&tool_name, &call_id);
                    call_names.insert(call_id, tool_name);
                }
                StreamEvent::ToolInputDelta { call_id, delta } => {
                    if let Some(name) = call_names.get(&call_id) {
                        self.fire_input_delta(name, &call_id, &delta);
                    }
                    emit(
                        ctx,
                        AgentStreamEvent::ToolInputDelta {
                            step: index,
                            call_id,
                            delta,
                        },
                    )
                    .await;
                }
                StreamEvent::ToolInputAvailable {
                    call_id,
                    tool_name,
                    input,
                } => {
                    if !call_names.contains_key(&call_id) {
                        self.fire_input_start(&tool_name, &call_id);
                    }
                    self.fire_input_available(&tool_name, &call_id, &input);
                }
                _ => {}
            }
        }

        assembler.finish(&model)
    }

    /// Resolve, validate and run the tool calls of a response.
    async fn dispatch(
        &self,
        index: usize,
        response: ProviderResponse,
        ctx: StepContext<'_>,
    ) -> Step {
        let raw_calls = response.message.tool_calls;
        let mut tool_calls = Vec::with_capacity(raw_calls.len());
        let mut results: Vec<(usize, ToolResult)> = Vec::new();
        let mut runnable: Vec<(usize, ToolCall, Arc<dyn ToolExecutor>)> = Vec::new();
        let mut deferred: Option<String> = None;

        for (pos, raw) in raw_calls.into_iter().enumerate() {
            let (arguments, dispatch) = match self.tools.resolve(&raw.name) {
                None => (
                    loose_arguments(&raw.arguments),
                    Err(ToolError::NotFound {
                        tool_name: raw.name.clone(),
                    }),
                ),
                Some(def) => match def.parse_input(&raw.arguments) {
                    Ok(input) => (input, Ok(def.executor().cloned())),
                    Err(e) => (loose_arguments(&raw.arguments), Err(e)),
                },
            };
            let call = ToolCall {
                id: raw.id,
                name: raw.name,
                arguments,
            };

            if deferred.is_some() {
                // Nothing after a deferred call is dispatched.
                emit_call(ctx, index, &call).await;
                tool_calls.push(call);
                continue;
            }

            match dispatch {
                Err(error) => {
                    warn!(
                        step = index,
                        tool = %call.name,
                        call_id = %call.id,
                        %error,
                        "Tool call rejected"
                    );
                    results.push((pos, ToolResult::error(&call.id, &call.name, error)));
                }
                Ok(Some(executor)) => runnable.push((pos, call.clone(), executor)),
                Ok(None) => {
                    debug!(
                        step = index,
                        tool = %call.name,
                        call_id = %call.id,
                        "No executor, deferring to caller"
                    );
                    deferred = Some(call.name.clone());
                }
            }

            emit_call(ctx, index, &call).await;
            tool_calls.push(call);
        }

        for (_, result) in &results {
            emit_result(ctx, index, result).await;
        }

        let executed = join_all(runnable.into_iter().map(|(pos, call, executor)| async move {
            (pos, self.run_tool(index, &call, executor, ctx).await)
        }))
        .await;
        results.extend(executed);
        results.sort_by_key(|(pos, _)| *pos);

        let finish_reason = if deferred.is_some() {
            FinishReason::Deferred
        } else {
            response.finish_reason
        };

        Step {
            index,
            text: response.message.content,
            tool_calls,
            tool_results: results.into_iter().map(|(_, r)| r).collect(),
            finish_reason,
            raw_finish_reason: response.raw_finish_reason,
            usage: response.usage.unwrap_or_default(),
            model: response.model,
        }
    }

    async fn run_tool(
        &self,
        index: usize,
        call: &ToolCall,
        executor: Arc<dyn ToolExecutor>,
        ctx: StepContext<'_>,
    ) -> ToolResult {
        let cancelled = || ToolError::Cancelled {
            tool_name: call.name.clone(),
        };
        if ctx.cancel.is_cancelled() {
            return ToolResult::error(&call.id, &call.name, cancelled());
        }

        debug!(step = index, tool = %call.name, call_id = %call.id, "Executing tool");
        let started = Instant::now();
        let execution = executor.execute(call.arguments.clone());
        let timed = async {
            match self.tool_timeout {
                Some(limit) => tokio::time::timeout(limit, execution)
                    .await
                    .unwrap_or_else(|_| {
                        Err(ToolError::Timeout {
                            tool_name: call.name.clone(),
                            timeout_ms: limit.as_millis() as u64,
                        })
                    }),
                None => execution.await,
            }
        };
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(cancelled()),
            outcome = timed => outcome,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(value) => ToolResult::output(&call.id, &call.name, value),
            Err(error) => {
                warn!(
                    step = index,
                    tool = %call.name,
                    call_id = %call.id,
                    %error,
                    "Tool execution failed"
                );
                ToolResult::error(&call.id, &call.name, error)
            }
        };

        if let Some(bus) = &self.event_bus {
            bus.publish(DomainEvent::ToolExecuted {
                tool_name: call.name.clone(),
                call_id: call.id.clone(),
                success: !result.is_error(),
                duration_ms,
                timestamp: chrono::Utc::now(),
            });
        }
        emit_result(ctx, index, &result).await;
        result
    }

    fn fire_input_start(&self, tool: &str, call_id: &str) {
        if let Some(hooks) = self.tools.resolve(tool).and_then(|d| d.hooks()) {
            guarded(tool, "on_input_start", || hooks.on_input_start(call_id));
        }
    }

    fn fire_input_delta(&self, tool: &str, call_id: &str, delta: &str) {
        if let Some(hooks) = self.tools.resolve(tool).and_then(|d| d.hooks()) {
            guarded(tool, "on_input_delta", || hooks.on_input_delta(call_id, delta));
        }
    }

    fn fire_input_available(&self, tool: &str, call_id: &str, raw: &str) {
        let Some(def) = self.tools.resolve(tool) else {
            return;
        };
        let Some(hooks) = def.hooks() else {
            return;
        };
        // Invalid input is reported as a tool result, not to the hook.
        if let Ok(input) = def.parse_input(raw) {
            guarded(tool, "on_input_available", || {
                hooks.on_input_available(call_id, &input)
            });
        }
    }
}

/// Messages a finished step contributes to the transcript: the assistant
/// message and one tool message per result.
pub fn step_messages(step: &Step) -> Vec<Message> {
    let calls = step
        .tool_calls
        .iter()
        .map(|c| {
            let arguments = match &c.arguments {
                Value::String(raw) => raw.clone(),
                other => other.to_string(),
            };
            MessageToolCall::new(&c.id, &c.name, arguments)
        })
        .collect();

    let mut messages = vec![Message::assistant_with_tool_calls(&step.text, calls)];
    messages.extend(
        step.tool_results
            .iter()
            .map(|r| Message::tool_result(&r.call_id, r.to_message_content())),
    );
    messages
}

/// Tool call ids must be unique within the response and across the run.
fn check_call_ids(state: &RunState, response: &ProviderResponse) -> Result<(), ProviderError> {
    let mut seen: HashSet<&str> = state.tool_calls().map(|c| c.id.as_str()).collect();
    for call in &response.message.tool_calls {
        if !seen.insert(call.id.as_str()) {
            return Err(ProviderError::InvalidResponse(format!(
                "duplicate tool call id {}",
                call.id
            )));
        }
    }
    Ok(())
}

fn loose_arguments(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn guarded(tool: &str, hook: &'static str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(tool, hook, "Tool input hook panicked, ignoring");
    }
}

async fn emit(ctx: StepContext<'_>, event: AgentStreamEvent) {
    if let Some(tx) = ctx.events {
        // A dropped receiver only means nobody is watching.
        let _ = tx.send(event).await;
    }
}

async fn emit_call(ctx: StepContext<'_>, index: usize, call: &ToolCall) {
    emit(
        ctx,
        AgentStreamEvent::ToolCall {
            step: index,
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.arguments.clone(),
        },
    )
    .await;
}

async fn emit_result(ctx: StepContext<'_>, index: usize, result: &ToolResult) {
    emit(
        ctx,
        AgentStreamEvent::ToolResult {
            step: index,
            id: result.call_id.clone(),
            name: result.tool_name.clone(),
            outcome: result.outcome.clone(),
        },
    )
    .await;
}
