//! The orchestration loop of steploop.
//!
//! A run alternates between the model and the tools:
//!
//! 1. **Prepare** the next request (transcript, system prompt, declared tools)
//! 2. **Invoke** the backend once, single-shot or streaming
//! 3. **Dispatch** the requested tool calls concurrently and record results
//! 4. **Check** the stop conditions against the run state
//!
//! The run ends when the model answers without tools, a stop condition fires,
//! a tool without executor hands control back (`Deferred`), the step ceiling
//! is reached, or the backend fails.

pub mod assembler;
pub mod error;
pub mod loop_runner;
pub mod scripted;
pub mod state;
pub mod step;
pub mod stop;
pub mod stream_event;

pub use assembler::StepAssembler;
pub use error::AgentError;
pub use loop_runner::{
    AgentLoop, GenerateOptions, GenerateResult, PrepareStepInput, StepOverrides, StreamingRun,
    text_stream,
};
pub use scripted::{ScriptError, ScriptedProvider, ScriptedTurn, load_script, parse_script};
pub use state::{RunState, RunStatus};
pub use step::{StepContext, StepExecutor, StepSettings, step_messages};
pub use stop::{
    StopCondition, StopReason, check_stop_conditions, has_finish_reason, has_tool_call,
    should_stop, step_count_is, stop_when, text_contains, text_matches,
};
pub use stream_event::AgentStreamEvent;
