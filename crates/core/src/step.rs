//! Step domain types: one round-trip with the model and what it produced.

use serde::{Deserialize, Serialize};

use crate::error::ToolError;
use crate::provider::Usage;

/// Why a step (or a whole run) finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// The model produced a final answer.
    Stop,
    /// The model requested tool calls.
    ToolCalls,
    /// The model hit its output token limit.
    Length,
    /// The provider filtered the output.
    ContentFilter,
    /// The backend failed.
    Error,
    /// A requested tool has no executor; control goes back to the caller.
    Deferred,
    /// A step ceiling ended a run that still wanted to continue.
    MaxSteps,
    /// Anything the provider reports that has no unified equivalent.
    Other,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool-calls",
            Self::Length => "length",
            Self::ContentFilter => "content-filter",
            Self::Error => "error",
            Self::Deferred => "deferred",
            Self::MaxSteps => "max-steps",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool call requested by the model, with its input parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the model's tool call id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Parsed input. Holds the raw text as a JSON string when parsing failed.
    pub arguments: serde_json::Value,
}

/// What a tool execution produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Output { value: serde_json::Value },
    Error { error: ToolError },
}

/// The result of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result answers
    pub call_id: String,

    /// The tool that was called
    pub tool_name: String,

    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn output(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            outcome: ToolOutcome::Output { value },
        }
    }

    pub fn error(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: ToolError,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            outcome: ToolOutcome::Error { error },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error { .. })
    }

    /// The failure, if the tool did not succeed.
    pub fn tool_error(&self) -> Option<&ToolError> {
        match &self.outcome {
            ToolOutcome::Error { error } => Some(error),
            ToolOutcome::Output { .. } => None,
        }
    }

    /// The output payload, if the tool succeeded.
    pub fn value(&self) -> Option<&serde_json::Value> {
        match &self.outcome {
            ToolOutcome::Output { value } => Some(value),
            ToolOutcome::Error { .. } => None,
        }
    }

    /// Text fed back to the model as the tool message content.
    pub fn to_message_content(&self) -> String {
        match &self.outcome {
            ToolOutcome::Output { value } => match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            ToolOutcome::Error { error } => format!("Error: {error}"),
        }
    }
}

/// One round-trip with the model. Immutable once appended to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 0-based ordinal within the run
    pub index: usize,

    /// Text emitted by the model (possibly empty)
    pub text: String,

    /// Tool calls requested in this step, in model order
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,

    /// Tool results, in call order
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,

    pub finish_reason: FinishReason,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_finish_reason: Option<String>,

    #[serde(default)]
    pub usage: Usage,

    /// Model that answered this step
    #[serde(default)]
    pub model: String,
}

impl Step {
    /// Whether the step requested a tool with the given name.
    pub fn has_tool_call(&self, name: &str) -> bool {
        self.tool_calls.iter().any(|c| c.name == name)
    }

    /// Tool calls that have no result in this step (deferred to the caller).
    pub fn pending_tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.tool_calls
            .iter()
            .filter(|c| !self.tool_results.iter().any(|r| r.call_id == c.id))
    }
}
