use std::time::Duration;

use shared::{
    domain::{ConversationId, InvalidId, UserId},
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

/// Errors surfaced by the session core.
///
/// The type is `Clone` because every caller coalesced onto one in-flight
/// initialization or restoration receives the same outcome.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("session for user {user_id} is not ready: {reason}")]
    NotReady { user_id: UserId, reason: String },
    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),
    #[error("authentication failed for user {user_id}: {reason}")]
    AuthFailure { user_id: UserId, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("send could not be verified after a transport error: {0}")]
    SendUnverified(String),
    #[error("operation for user {0} was cancelled")]
    Cancelled(UserId),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Preserves the full context chain of a transport error.
    pub fn transport(err: anyhow::Error) -> Self {
        Self::Transport(format!("{err:#}"))
    }

    pub fn not_ready(user_id: &UserId, reason: impl Into<String>) -> Self {
        Self::NotReady {
            user_id: user_id.clone(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::Validation,
            Self::NotReady { .. } => ErrorCode::NotReady,
            Self::ConversationNotFound(_) => ErrorCode::NotFound,
            Self::AuthFailure { .. } => ErrorCode::AuthFailure,
            Self::Transport(_) | Self::SendUnverified(_) => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<InvalidId> for SessionError {
    fn from(value: InvalidId) -> Self {
        Self::Validation(value.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(value: SessionError) -> Self {
        ApiError::new(value.code(), value.to_string())
    }
}
