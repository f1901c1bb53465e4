//! Folds a provider event stream into a complete response.

use steploop_core::error::ProviderError;
use steploop_core::message::{Message, MessageToolCall};
use steploop_core::provider::{ProviderResponse, StreamEvent, Usage};
use steploop_core::step::FinishReason;

#[derive(Debug)]
struct PendingCall {
    id: String,
    name: String,
    input: String,
    available: bool,
}

#[derive(Debug)]
struct Finished {
    finish_reason: FinishReason,
    raw_finish_reason: Option<String>,
    usage: Usage,
    model: Option<String>,
}

/// Accumulates the events of one step.
///
/// Text deltas are concatenated in arrival order; tool calls keep the order in
/// which their input started. The response is only complete once `Finish` has
/// been pushed.
#[derive(Debug, Default)]
pub struct StepAssembler {
    text: String,
    calls: Vec<PendingCall>,
    finished: Option<Finished>,
}

impl StepAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text received so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    fn call_mut(&mut self, call_id: &str) -> Option<&mut PendingCall> {
        self.calls.iter_mut().find(|c| c.id == call_id)
    }

    pub fn push(&mut self, event: &StreamEvent) -> Result<(), ProviderError> {
        if self.finished.is_some() && !matches!(event, StreamEvent::End) {
            return Err(ProviderError::InvalidResponse(
                "event received after finish".into(),
            ));
        }

        match event {
            StreamEvent::Start
            | StreamEvent::End
            | StreamEvent::TextStart { .. }
            | StreamEvent::TextEnd { .. } => {}
            StreamEvent::TextDelta { delta, .. } => self.text.push_str(delta),
            StreamEvent::ToolInputStart { call_id, tool_name } => {
                if self.call_mut(call_id).is_some() {
                    return Err(ProviderError::InvalidResponse(format!(
                        "duplicate tool call id {call_id}"
                    )));
                }
                self.calls.push(PendingCall {
                    id: call_id.clone(),
                    name: tool_name.clone(),
                    input: String::new(),
                    available: false,
                });
            }
            StreamEvent::ToolInputDelta { call_id, delta } => {
                let call = self.call_mut(call_id).ok_or_else(|| {
                    ProviderError::InvalidResponse(format!(
                        "input delta for unknown tool call {call_id}"
                    ))
                })?;
                call.input.push_str(delta);
            }
            StreamEvent::ToolInputAvailable {
                call_id,
                tool_name,
                input,
            } => match self.call_mut(call_id) {
                Some(call) => {
                    call.input = input.clone();
                    call.available = true;
                }
                None => self.calls.push(PendingCall {
                    id: call_id.clone(),
                    name: tool_name.clone(),
                    input: input.clone(),
                    available: true,
                }),
            },
            StreamEvent::Finish {
                finish_reason,
                raw_finish_reason,
                usage,
                model,
            } => {
                self.finished = Some(Finished {
                    finish_reason: *finish_reason,
                    raw_finish_reason: raw_finish_reason.clone(),
                    usage: *usage,
                    model: model.clone(),
                });
            }
        }
        Ok(())
    }

    /// Build the response. Fails if the stream never finished.
    pub fn finish(self, fallback_model: &str) -> Result<ProviderResponse, ProviderError> {
        let Some(finished) = self.finished else {
            return Err(ProviderError::StreamInterrupted(
                "stream ended before a finish event".into(),
            ));
        };

        let tool_calls = self
            .calls
            .into_iter()
            .map(|c| {
                if !c.available {
                    tracing::debug!(
                        call_id = %c.id,
                        "tool input never marked available, using deltas"
                    );
                }
                MessageToolCall::new(c.id, c.name, c.input)
            })
            .collect();

        Ok(ProviderResponse {
            message: Message::assistant_with_tool_calls(self.text, tool_calls),
            finish_reason: finished.finish_reason,
            raw_finish_reason: finished.raw_finish_reason,
            usage: Some(finished.usage),
            model: finished.model.unwrap_or_else(|| fallback_model.to_string()),
        })
    }
}
