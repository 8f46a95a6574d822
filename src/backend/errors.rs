//! Backend connection error types.

use thiserror::Error;

/// Errors that can occur while talking to a tool provider process.
///
/// Every variant is local to one provider. None of them is fatal to the
/// proxy as a whole.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The provider executable could not be spawned.
    #[error("failed to launch provider '{provider}': {reason}")]
    Launch { provider: String, reason: String },

    /// Capability discovery failed or timed out.
    #[error("capability discovery failed for provider '{provider}': {reason}")]
    CapabilityList { provider: String, reason: String },

    /// The provider reported a failure for a tool call.
    ///
    /// Tool execution failures and transport failures during a call are
    /// both reported through this variant.
    #[error("{message}")]
    Invocation { provider: String, message: String },

    /// A tool call exceeded the configured ceiling.
    #[error("tool call '{provider}.{tool}' timed out after {timeout_ms}ms")]
    InvocationTimeout {
        provider: String,
        tool: String,
        timeout_ms: u64,
    },

    /// Malformed frame, unexpected EOF, or a failed handshake.
    #[error("protocol error for provider '{provider}': {reason}")]
    Protocol { provider: String, reason: String },

    /// The connection is not in the `ready` state.
    #[error("provider '{provider}' is not ready (state: {state})")]
    NotReady { provider: String, state: String },
}

impl BackendError {
    /// Short machine-readable kind, surfaced to front-end clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "launch_error",
            Self::CapabilityList { .. } => "capability_list_error",
            Self::Invocation { .. } | Self::NotReady { .. } => "invocation_error",
            Self::InvocationTimeout { .. } => "invocation_timeout_error",
            Self::Protocol { .. } => "protocol_error",
        }
    }

    /// Fold any failure that happened during a call into `Invocation`.
    ///
    /// Callers of `invoke` only distinguish "succeeded with value" from
    /// "failed with message"; the timeout ceiling keeps its own kind.
    pub(crate) fn into_invocation(self, provider: &str) -> Self {
        match self {
            Self::Invocation { .. } | Self::InvocationTimeout { .. } => self,
            other => Self::Invocation {
                provider: provider.to_string(),
                message: other.to_string(),
            },
        }
    }
}
