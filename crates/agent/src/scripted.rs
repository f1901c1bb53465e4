//! Scripted provider: a deterministic backend for tests and replays.
//!
//! Each backend invocation consumes the next scripted turn, whatever the
//! request says. Every request is recorded so tests can assert on what the
//! loop sent. Scripts can also be loaded from JSON files:
//!
//! ```json
//! [
//!   {"kind": "response", "tool_calls": [{"name": "getWeather", "input": {"city": "Tokyo"}}]},
//!   {"kind": "text_stream", "chunks": ["It is ", "68°F."]},
//!   {"kind": "error", "status": 503, "message": "overloaded"}
//! ]
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use steploop_core::error::ProviderError;
use steploop_core::message::{Message, MessageToolCall};
use steploop_core::provider::{
    Provider, ProviderRequest, ProviderResponse, ProviderStream, StreamEvent, Usage,
    response_events,
};
use steploop_core::step::FinishReason;

use crate::assembler::StepAssembler;

const MOCK_MODEL: &str = "mock-model";

/// One scripted backend reply.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// A complete response.
    Response(ProviderResponse),
    /// An ordered event feed.
    Stream(Vec<StreamEvent>),
    /// A backend failure.
    Error(ProviderError),
}

type Responder = Box<dyn Fn(&ProviderRequest) -> ScriptedTurn + Send + Sync>;

enum Source {
    Script(Mutex<VecDeque<ScriptedTurn>>),
    Responder(Responder),
}

pub struct ScriptedProvider {
    source: Source,
    requests: Mutex<Vec<ProviderRequest>>,
    latency: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            source: Source::Script(Mutex::new(turns.into())),
            requests: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    /// A provider that answers every request with `f(request)`.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&ProviderRequest) -> ScriptedTurn + Send + Sync + 'static,
    {
        Self {
            source: Source::Responder(Box::new(f)),
            requests: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    /// Delay every reply by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Turns not yet consumed. Always 0 for `from_fn` providers.
    pub fn remaining(&self) -> usize {
        match &self.source {
            Source::Script(turns) => turns.lock().unwrap_or_else(|e| e.into_inner()).len(),
            Source::Responder(_) => 0,
        }
    }

    async fn next_turn(&self, request: ProviderRequest) -> Result<ScriptedTurn, ProviderError> {
        let turn = {
            let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            let served = requests.len();
            let turn = match &self.source {
                Source::Script(turns) => turns
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .pop_front()
                    .ok_or(ProviderError::ScriptExhausted { calls: served }),
                Source::Responder(f) => Ok(f(&request)),
            };
            requests.push(request);
            turn
        };

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        turn
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let model = request.model.clone();
        match self.next_turn(request).await? {
            ScriptedTurn::Response(response) => Ok(response),
            ScriptedTurn::Stream(events) => {
                let mut assembler = StepAssembler::new();
                for event in &events {
                    assembler.push(event)?;
                }
                assembler.finish(&model)
            }
            ScriptedTurn::Error(e) => Err(e),
        }
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ProviderStream, ProviderError> {
        let events = match self.next_turn(request).await? {
            ScriptedTurn::Response(response) => response_events(response),
            ScriptedTurn::Stream(events) => events,
            ScriptedTurn::Error(e) => return Err(e),
        };
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }
}

// ---------------------------------------------------------------------------
// Turn builders
// ---------------------------------------------------------------------------

/// Build a complete response.
pub fn make_response(
    text: impl Into<String>,
    tool_calls: Vec<MessageToolCall>,
    finish_reason: FinishReason,
) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_with_tool_calls(text, tool_calls),
        finish_reason,
        raw_finish_reason: None,
        usage: Some(Usage::new(10, 5)),
        model: MOCK_MODEL.into(),
    }
}

/// A plain text answer.
pub fn text_response(text: impl Into<String>) -> ScriptedTurn {
    ScriptedTurn::Response(make_response(text, vec![], FinishReason::Stop))
}

/// A response that only requests tools.
pub fn tool_call_response(tool_calls: Vec<MessageToolCall>) -> ScriptedTurn {
    ScriptedTurn::Response(make_response("", tool_calls, FinishReason::ToolCalls))
}

pub fn tool_call(id: impl Into<String>, name: impl Into<String>, input: Value) -> MessageToolCall {
    MessageToolCall::new(id, name, input.to_string())
}

/// A streamed text answer delivered in the given chunks.
pub fn text_chunks<S: AsRef<str>>(chunks: &[S]) -> ScriptedTurn {
    let id = "text-1".to_string();
    let mut events = vec![StreamEvent::Start, StreamEvent::TextStart { id: id.clone() }];
    events.extend(chunks.iter().map(|c| StreamEvent::TextDelta {
        id: id.clone(),
        delta: c.as_ref().to_string(),
    }));
    events.push(StreamEvent::TextEnd { id });
    events.push(StreamEvent::End);
    events.push(StreamEvent::Finish {
        finish_reason: FinishReason::Stop,
        raw_finish_reason: None,
        usage: Usage::new(10, chunks.len() as u32),
        model: Some(MOCK_MODEL.into()),
    });
    ScriptedTurn::Stream(events)
}

// ---------------------------------------------------------------------------
// Script files
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Failed to read script {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse script: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct ScriptToolCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ScriptEntry {
    Response {
        #[serde(default)]
        text: String,
        #[serde(default)]
        tool_calls: Vec<ScriptToolCall>,
        #[serde(default)]
        finish_reason: Option<FinishReason>,
    },
    TextStream {
        chunks: Vec<String>,
    },
    Stream {
        events: Vec<StreamEvent>,
    },
    Error {
        #[serde(default = "default_error_status")]
        status: u16,
        message: String,
    },
}

fn default_error_status() -> u16 {
    500
}

impl ScriptEntry {
    fn into_turn(self, turn: usize) -> ScriptedTurn {
        match self {
            Self::Response {
                text,
                tool_calls,
                finish_reason,
            } => {
                let finish_reason = finish_reason.unwrap_or(if tool_calls.is_empty() {
                    FinishReason::Stop
                } else {
                    FinishReason::ToolCalls
                });
                let calls = tool_calls
                    .into_iter()
                    .enumerate()
                    .map(|(i, c)| {
                        let id = c.id.unwrap_or_else(|| format!("call_{turn}_{i}"));
                        let input = if c.input.is_null() {
                            Value::Object(Default::default())
                        } else {
                            c.input
                        };
                        tool_call(id, c.name, input)
                    })
                    .collect();
                ScriptedTurn::Response(make_response(text, calls, finish_reason))
            }
            Self::TextStream { chunks } => text_chunks(&chunks),
            Self::Stream { events } => ScriptedTurn::Stream(events),
            Self::Error { status, message } => ScriptedTurn::Error(ProviderError::ApiError {
                status_code: status,
                message,
            }),
        }
    }
}

/// Parse a JSON script (an array of turns).
pub fn parse_script(json: &str) -> Result<Vec<ScriptedTurn>, ScriptError> {
    let entries: Vec<ScriptEntry> = serde_json::from_str(json)?;
    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(i, e)| e.into_turn(i))
        .collect())
}

/// Load a JSON script from disk.
pub fn load_script(path: &Path) -> Result<Vec<ScriptedTurn>, ScriptError> {
    let json = std::fs::read_to_string(path).map_err(|source| ScriptError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_script(&json)
}
