//! Run state: the ordered transcript of one orchestration run.
//!
//! A `RunState` is owned by exactly one invocation. Steps are appended in
//! order and numbered `0..len`; once the run reaches a terminal status the
//! transcript is frozen.

use serde::{Deserialize, Serialize};
use std::fmt;
use steploop_core::provider::Usage;
use steploop_core::step::{FinishReason, Step, ToolCall, ToolResult};

use crate::error::AgentError;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    /// A requested tool has no executor; control is handed back to the caller.
    Deferred,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Deferred => "deferred",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunState {
    steps: Vec<Step>,
    usage: Usage,
    status: RunStatus,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a running state from existing steps, renumbering them in order.
    pub fn from_steps(steps: impl IntoIterator<Item = Step>) -> Self {
        let mut state = Self::new();
        for step in steps {
            // A fresh state is never terminal.
            let _ = state.append(step);
        }
        state
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn last_step(&self) -> Option<&Step> {
        self.steps.last()
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Token usage summed over all steps.
    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// All tool calls across all steps, in step order.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.steps.iter().flat_map(|s| s.tool_calls.iter())
    }

    /// All tool results across all steps, in step order.
    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResult> {
        self.steps.iter().flat_map(|s| s.tool_results.iter())
    }

    /// Append a step, assigning it the next ordinal.
    pub fn append(&mut self, mut step: Step) -> Result<&Step, AgentError> {
        if self.is_terminal() {
            return Err(AgentError::Terminal(self.status.as_str()));
        }
        step.index = self.steps.len();
        self.usage += step.usage;
        self.steps.push(step);
        Ok(&self.steps[self.steps.len() - 1])
    }

    /// Move to a terminal status. A terminal status never changes again.
    pub(crate) fn finish(&mut self, status: RunStatus) {
        if !self.is_terminal() {
            self.status = status;
        }
    }

    /// Finish reason of the most recent step, if any.
    pub fn last_finish_reason(&self) -> Option<FinishReason> {
        self.last_step().map(|s| s.finish_reason)
    }
}
