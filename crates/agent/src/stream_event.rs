//! Run-level streaming events.
//!
//! `AgentStreamEvent` lifts provider stream chunks and loop milestones into
//! one feed that `AgentLoop::stream` hands to the caller. Observers only see
//! deltas here; the transcript itself is never exposed half-built.

use serde::{Deserialize, Serialize};
use steploop_core::provider::Usage;
use steploop_core::step::{FinishReason, ToolOutcome};

use crate::state::RunStatus;

/// Events emitted while a run executes.
///
/// - `step_start`  : a backend call is about to be made
/// - `text_delta`  : partial text from the model
/// - `tool_input_delta` : partial raw input of a tool call
/// - `tool_call`   : a tool call was parsed and validated
/// - `tool_result` : a tool finished (or failed)
/// - `step_finish` : the step was appended to the transcript
/// - `done`        : the run reached a terminal state
/// - `error`       : the run failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    StepStart {
        step: usize,
    },

    TextDelta {
        step: usize,
        content: String,
    },

    ToolInputDelta {
        step: usize,
        call_id: String,
        delta: String,
    },

    ToolCall {
        step: usize,
        id: String,
        name: String,
        input: serde_json::Value,
    },

    ToolResult {
        step: usize,
        id: String,
        name: String,
        #[serde(flatten)]
        outcome: ToolOutcome,
    },

    StepFinish {
        step: usize,
        finish_reason: FinishReason,
        usage: Usage,
    },

    Done {
        conversation_id: String,
        status: RunStatus,
        finish_reason: FinishReason,
        usage: Usage,
        steps: usize,
        tool_calls_made: usize,
    },

    Error {
        message: String,
    },
}

impl AgentStreamEvent {
    /// SSE-style event name for this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StepStart { .. } => "step_start",
            Self::TextDelta { .. } => "text_delta",
            Self::ToolInputDelta { .. } => "tool_input_delta",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::StepFinish { .. } => "step_finish",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Text carried by a `text_delta` event.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::TextDelta { content, .. } => Some(content),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
