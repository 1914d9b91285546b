//! Error types for the session and cache coordinator.
//!
//! Every failure is classifiable into an [`ErrorClass`], which is what the
//! refresh scheduler, the query cache and the mutation executor act on.

use thiserror::Error;

use crate::error_codes::ErrorCode;

/// Coarse classification that drives retry and sign-out policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network trouble or a timeout. Retry on the next trigger; never touch
    /// the session or cached values.
    Transient,
    /// The credential was rejected. Clears the session.
    Unauthenticated,
    /// A business rule refused the request (e.g. not enough action points).
    DomainRejected,
}

/// Errors produced by the coordinator and its collaborators.
///
/// The type is `Clone` because a single in-flight outcome is handed to every
/// caller that coalesced onto it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// The backend answered with a structured error.
    #[error("backend error ({code}): {message}")]
    Backend {
        /// Stable error code reported by the backend.
        code: ErrorCode,
        /// Human-readable message from the backend.
        message: String,
    },

    /// The request never produced a backend answer.
    #[error("transport error: {0}")]
    Transport(String),

    /// An operation did not resolve within its configured bound.
    #[error("operation timed out")]
    Timeout,

    /// There is no session to refresh or to authenticate a call with.
    #[error("no active session")]
    NoSession,

    /// Failed to serialize or deserialize a payload.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Durable session storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A newer attempt started before this one resolved; its result was discarded.
    #[error("superseded by a newer attempt")]
    Superseded,

    /// The coordinator was torn down.
    #[error("coordinator torn down")]
    TornDown,

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl SyncError {
    /// Build a [`SyncError::Backend`] from a code and message.
    pub fn backend(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Backend {
            code,
            message: message.into(),
        }
    }

    /// Classify this error for retry and sign-out policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Backend { code, .. } => code.class(),
            Self::NoSession => ErrorClass::Unauthenticated,
            Self::Transport(_)
            | Self::Timeout
            | Self::Serialization(_)
            | Self::Storage(_)
            | Self::Superseded
            | Self::TornDown
            | Self::TaskFailed(_) => ErrorClass::Transient,
        }
    }

    /// Shorthand for `class() == ErrorClass::Unauthenticated`.
    pub fn is_unauthenticated(&self) -> bool {
        self.class() == ErrorClass::Unauthenticated
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// A specialized [`Result`] type for coordinator operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_timeout_are_transient() {
        assert_eq!(
            SyncError::Transport("reset".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(SyncError::Timeout.class(), ErrorClass::Transient);
    }

    #[test]
    fn backend_errors_follow_their_code() {
        let err = SyncError::backend(ErrorCode::InvalidRefreshToken, "revoked");
        assert!(err.is_unauthenticated());

        let err = SyncError::backend(ErrorCode::InsufficientAp, "need 1 AP");
        assert_eq!(err.class(), ErrorClass::DomainRejected);

        let err = SyncError::backend(ErrorCode::ServiceUnavailable, "down");
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn missing_session_reads_as_signed_out() {
        assert!(SyncError::NoSession.is_unauthenticated());
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = SyncError::backend(ErrorCode::RaidCapReached, "3/3 raids today");
        assert_eq!(
            err.to_string(),
            "backend error (RAID_CAP_REACHED): 3/3 raids today"
        );
    }
}
