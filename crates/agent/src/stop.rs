//! Stop conditions for the orchestration loop.
//!
//! A stop condition is a predicate over the run state, evaluated after every
//! step. Conditions are checked in declared order and the first one that fires
//! decides the stop reason.
//!
//! # Built-in conditions
//!
//! - [`step_count_is`]: stop once the run has N steps
//! - [`has_tool_call`]: stop when the last step called a given tool
//! - [`has_finish_reason`]: stop on a given finish reason
//! - [`text_contains`] / [`text_matches`]: stop on the last step's text
//! - [`stop_when`]: wrap an arbitrary predicate
//!
//! Custom conditions implement [`StopCondition`] directly.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use steploop_core::step::FinishReason;

use crate::state::RunState;

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopReason {
    /// The model answered without requesting tools.
    ModelFinished,
    /// A requested tool has no executor.
    Deferred { tool_name: String },
    /// `step_count_is` fired.
    StepCount { limit: usize },
    /// The hard step ceiling of the loop was reached.
    MaxSteps { limit: usize },
    ToolCalled { tool_name: String },
    FinishReason { reason: FinishReason },
    TextMatched { pattern: String },
    Custom { label: String },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModelFinished => write!(f, "model finished"),
            Self::Deferred { tool_name } => write!(f, "deferred to caller: {tool_name}"),
            Self::StepCount { limit } => write!(f, "step count reached {limit}"),
            Self::MaxSteps { limit } => write!(f, "max steps ({limit}) reached"),
            Self::ToolCalled { tool_name } => write!(f, "tool called: {tool_name}"),
            Self::FinishReason { reason } => write!(f, "finish reason: {reason}"),
            Self::TextMatched { pattern } => write!(f, "text matched: {pattern}"),
            Self::Custom { label } => write!(f, "{label}"),
        }
    }
}

/// A predicate over the run state.
pub trait StopCondition: Send + Sync {
    /// Short identifier used in logs.
    fn id(&self) -> &str;

    /// Return a reason when the run should stop.
    fn check(&self, state: &RunState) -> Option<StopReason>;
}

impl fmt::Debug for dyn StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StopCondition({})", self.id())
    }
}

/// Evaluate conditions in declared order and return the first match.
///
/// A state without steps never stops.
pub fn check_stop_conditions(
    conditions: &[Arc<dyn StopCondition>],
    state: &RunState,
) -> Option<StopReason> {
    if state.is_empty() {
        return None;
    }
    conditions.iter().find_map(|condition| {
        let reason = condition.check(state);
        if let Some(reason) = &reason {
            tracing::debug!(condition = condition.id(), %reason, "stop condition fired");
        }
        reason
    })
}

/// Whether any condition fires for the given state.
pub fn should_stop(state: &RunState, conditions: &[Arc<dyn StopCondition>]) -> bool {
    check_stop_conditions(conditions, state).is_some()
}

// ---------------------------------------------------------------------------
// Built-in conditions
// ---------------------------------------------------------------------------

pub struct StepCountIs(pub usize);

impl StopCondition for StepCountIs {
    fn id(&self) -> &str {
        "step_count_is"
    }

    fn check(&self, state: &RunState) -> Option<StopReason> {
        (state.step_count() >= self.0).then_some(StopReason::StepCount { limit: self.0 })
    }
}

pub struct HasToolCall(pub String);

impl StopCondition for HasToolCall {
    fn id(&self) -> &str {
        "has_tool_call"
    }

    fn check(&self, state: &RunState) -> Option<StopReason> {
        let step = state.last_step()?;
        step.has_tool_call(&self.0).then(|| StopReason::ToolCalled {
            tool_name: self.0.clone(),
        })
    }
}

pub struct HasFinishReason(pub FinishReason);

impl StopCondition for HasFinishReason {
    fn id(&self) -> &str {
        "has_finish_reason"
    }

    fn check(&self, state: &RunState) -> Option<StopReason> {
        (state.last_finish_reason()? == self.0)
            .then_some(StopReason::FinishReason { reason: self.0 })
    }
}

/// Case-insensitive substring match on the last step's text.
pub struct TextContains {
    needle: String,
}

impl StopCondition for TextContains {
    fn id(&self) -> &str {
        "text_contains"
    }

    fn check(&self, state: &RunState) -> Option<StopReason> {
        let step = state.last_step()?;
        let found = step.text.to_lowercase().contains(&self.needle);
        tracing::debug!(step = step.index, needle = %self.needle, found, "text_contains evaluated");
        found.then(|| StopReason::TextMatched {
            pattern: self.needle.clone(),
        })
    }
}

pub struct TextMatches(pub Regex);

impl StopCondition for TextMatches {
    fn id(&self) -> &str {
        "text_matches"
    }

    fn check(&self, state: &RunState) -> Option<StopReason> {
        let step = state.last_step()?;
        self.0.is_match(&step.text).then(|| StopReason::TextMatched {
            pattern: self.0.as_str().to_string(),
        })
    }
}

/// An arbitrary predicate with a label.
pub struct StopWhen<F> {
    label: String,
    predicate: F,
}

impl<F> StopCondition for StopWhen<F>
where
    F: Fn(&RunState) -> bool + Send + Sync,
{
    fn id(&self) -> &str {
        &self.label
    }

    fn check(&self, state: &RunState) -> Option<StopReason> {
        (self.predicate)(state).then(|| StopReason::Custom {
            label: self.label.clone(),
        })
    }
}

pub fn step_count_is(n: usize) -> Arc<dyn StopCondition> {
    Arc::new(StepCountIs(n))
}

pub fn has_tool_call(name: impl Into<String>) -> Arc<dyn StopCondition> {
    Arc::new(HasToolCall(name.into()))
}

pub fn has_finish_reason(reason: FinishReason) -> Arc<dyn StopCondition> {
    Arc::new(HasFinishReason(reason))
}

pub fn text_contains(needle: impl AsRef<str>) -> Arc<dyn StopCondition> {
    Arc::new(TextContains {
        needle: needle.as_ref().to_lowercase(),
    })
}

pub fn text_matches(pattern: &str) -> Result<Arc<dyn StopCondition>, regex::Error> {
    Ok(Arc::new(TextMatches(Regex::new(pattern)?)))
}

pub fn stop_when<F>(label: impl Into<String>, predicate: F) -> Arc<dyn StopCondition>
where
    F: Fn(&RunState) -> bool + Send + Sync + 'static,
{
    Arc::new(StopWhen {
        label: label.into(),
        predicate,
    })
}
