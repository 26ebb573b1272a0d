use std::time::Duration;

use watira_core::errors::GatewayError;
use watira_core::events::ErrorReason;
use watira_core::SessionId;
use watira_store::StoreError;

/// Why a turn stopped before reaching `Done`.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("model error: {0}")]
    Model(#[from] GatewayError),

    #[error("tool loop limit exceeded: more than {0} tool calls in one turn")]
    ToolLoopLimitExceeded(u32),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("turn cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl TurnError {
    /// Wire classification sent in the `error` event.
    pub fn reason(&self) -> ErrorReason {
        match self {
            Self::SessionNotFound(_) => ErrorReason::NotFound,
            Self::Store(e) if e.is_not_found() => ErrorReason::NotFound,
            Self::Store(e) if e.is_transient() => ErrorReason::TransientFailure,
            Self::Store(_) => ErrorReason::Internal,
            Self::Model(GatewayError::Timeout(_)) => ErrorReason::Timeout,
            Self::Model(e) if e.is_fatal() => ErrorReason::ModelFailure,
            Self::Model(e) if e.is_retryable() => ErrorReason::TransientFailure,
            Self::Model(_) => ErrorReason::Internal,
            Self::ToolLoopLimitExceeded(_) => ErrorReason::ToolLoopLimitExceeded,
            Self::Timeout { .. } => ErrorReason::Timeout,
            Self::Cancelled | Self::Internal(_) => ErrorReason::Internal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Model(GatewayError::Cancelled))
    }
}

/// Failures of an artifact computation. Never cached.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CacheError {
    #[error("artifact computation timed out after {0:?}")]
    Timeout(Duration),

    #[error("artifact computation failed: {0}")]
    Compute(String),

    #[error("artifact store error: {0}")]
    Store(String),
}

impl From<StoreError> for CacheError {
    fn from(e: StoreError) -> Self {
        CacheError::Store(e.to_string())
    }
}
