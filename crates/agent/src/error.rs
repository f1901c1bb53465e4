//! Errors that end a run.
//!
//! Tool faults never show up here: they are recorded as error results inside
//! the step and fed back to the model. Only backend faults and cancellation
//! move a run to `Failed`.

use steploop_core::error::ProviderError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run already terminal ({0}); no further steps can be appended")]
    Terminal(&'static str),
}

impl AgentError {
    /// Whether the error came from the backend rather than the caller.
    pub fn is_provider(&self) -> bool {
        matches!(self, Self::Provider(_))
    }
}

impl From<AgentError> for steploop_core::Error {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Provider(p) => steploop_core::Error::Provider(p),
            other => steploop_core::Error::Internal(other.to_string()),
        }
    }
}
