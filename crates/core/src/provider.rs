//! Provider trait: the abstraction over model backends.
//!
//! A Provider knows how to send a transcript to a model and get one step's
//! worth of response back, either as a complete message or as a stream of
//! events. The orchestration loop treats it as an opaque capability.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::{Message, MessageToolCall};
use crate::step::FinishReason;

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use
    pub model: String,

    /// The conversation messages
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclaration>,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

/// A tool declaration sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete (non-streaming) response from a provider: one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated message (text and tool calls)
    pub message: Message,

    /// Why the model stopped generating
    pub finish_reason: FinishReason,

    /// The provider's own finish reason string, when it differs from the unified one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_finish_reason: Option<String>,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Saturating sum of two usage records.
    pub fn add(&self, other: &Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens.saturating_add(other.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(other.completion_tokens),
            total_tokens: self.total_tokens.saturating_add(other.total_tokens),
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, other: Usage) {
        *self = self.add(&other);
    }
}

/// A single event of an incremental provider response.
///
/// A step's event feed is finite and cannot be restarted; it is complete
/// only once `Finish` has been observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// The response started.
    Start,

    /// A text part with the given id begins.
    TextStart { id: String },

    /// Partial text for a text part.
    TextDelta { id: String, delta: String },

    /// A text part is complete.
    TextEnd { id: String },

    /// The model started producing the input of a tool call.
    ToolInputStart { call_id: String, tool_name: String },

    /// Partial tool input text.
    ToolInputDelta { call_id: String, delta: String },

    /// The full tool input is available.
    ToolInputAvailable {
        call_id: String,
        tool_name: String,
        input: String,
    },

    /// The response content is complete.
    End,

    /// Final event carrying the finish reason and usage.
    Finish {
        finish_reason: FinishReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_finish_reason: Option<String>,
        #[serde(default)]
        usage: Usage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
}

/// A boxed, lazily-consumed feed of stream events.
pub type ProviderStream = BoxStream<'static, Result<StreamEvent, ProviderError>>;

/// Expand a complete response into the event sequence a streaming backend
/// would have produced for it.
pub fn response_events(response: ProviderResponse) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::Start];

    if !response.message.content.is_empty() {
        let id = "text-1".to_string();
        events.push(StreamEvent::TextStart { id: id.clone() });
        events.push(StreamEvent::TextDelta {
            id: id.clone(),
            delta: response.message.content,
        });
        events.push(StreamEvent::TextEnd { id });
    }

    for MessageToolCall { id, name, arguments } in response.message.tool_calls {
        events.push(StreamEvent::ToolInputStart {
            call_id: id.clone(),
            tool_name: name.clone(),
        });
        events.push(StreamEvent::ToolInputAvailable {
            call_id: id,
            tool_name: name,
            input: arguments,
        });
    }

    events.push(StreamEvent::End);
    events.push(StreamEvent::Finish {
        finish_reason: response.finish_reason,
        raw_finish_reason: response.raw_finish_reason,
        usage: response.usage.unwrap_or_default(),
        model: Some(response.model),
    });
    events
}

/// The core Provider trait.
///
/// Every backend (remote API client, local engine, scripted test double)
/// implements this trait. The step executor calls `complete()` or `stream()`
/// exactly once per step without knowing which backend is in use.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider.
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Send a request and get a stream of response events.
    ///
    /// Default implementation calls `complete()` and replays the result as events.
    async fn stream(&self, request: ProviderRequest) -> Result<ProviderStream, ProviderError> {
        let response = self.complete(request).await?;
        Ok(stream::iter(response_events(response).into_iter().map(Ok)).boxed())
    }
}
