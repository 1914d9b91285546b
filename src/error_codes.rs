//! Stable error codes reported by the game backend.
//!
//! The backend sends these as `"SCREAMING_SNAKE_CASE"` strings. Codes this
//! client does not know deserialize to [`ErrorCode::Unknown`] and are treated
//! as transient.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ErrorClass;

/// Structured error codes returned by the game backend.
///
/// Use [`class()`](ErrorCode::class) to decide retry and sign-out policy and
/// [`description()`](ErrorCode::description) for a player-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication errors
    Unauthorized,
    InvalidToken,
    InvalidRefreshToken,
    RefreshTokenRevoked,
    SessionNotFound,
    UserBanned,

    // Domain rejections
    InvalidInput,
    InsufficientAp,
    InsufficientCoins,
    JobNotReady,
    JobAlreadyRunning,
    TargetUnavailable,
    RaidCapReached,
    UpgradeMaxed,
    AlreadyInClan,

    // Rate limiting
    RateLimitExceeded,

    // Server errors
    InternalError,
    ServiceUnavailable,

    /// Any code this client version does not recognize.
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Classify the code for retry and sign-out policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Unauthorized
            | Self::InvalidToken
            | Self::InvalidRefreshToken
            | Self::RefreshTokenRevoked
            | Self::SessionNotFound
            | Self::UserBanned => ErrorClass::Unauthenticated,

            Self::InvalidInput
            | Self::InsufficientAp
            | Self::InsufficientCoins
            | Self::JobNotReady
            | Self::JobAlreadyRunning
            | Self::TargetUnavailable
            | Self::RaidCapReached
            | Self::UpgradeMaxed
            | Self::AlreadyInClan => ErrorClass::DomainRejected,

            Self::RateLimitExceeded
            | Self::InternalError
            | Self::ServiceUnavailable
            | Self::Unknown => ErrorClass::Transient,
        }
    }

    /// The wire name of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::InvalidRefreshToken => "INVALID_REFRESH_TOKEN",
            Self::RefreshTokenRevoked => "REFRESH_TOKEN_REVOKED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::UserBanned => "USER_BANNED",
            Self::InvalidInput => "INVALID_INPUT",
            Self::InsufficientAp => "INSUFFICIENT_AP",
            Self::InsufficientCoins => "INSUFFICIENT_COINS",
            Self::JobNotReady => "JOB_NOT_READY",
            Self::JobAlreadyRunning => "JOB_ALREADY_RUNNING",
            Self::TargetUnavailable => "TARGET_UNAVAILABLE",
            Self::RaidCapReached => "RAID_CAP_REACHED",
            Self::UpgradeMaxed => "UPGRADE_MAXED",
            Self::AlreadyInClan => "ALREADY_IN_CLAN",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Returns a player-facing description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            // Authentication errors
            Self::Unauthorized => "You are not signed in. Please sign in again.",
            Self::InvalidToken => "Your session token is invalid or has expired.",
            Self::InvalidRefreshToken => {
                "Your session could not be renewed. Please sign in again."
            }
            Self::RefreshTokenRevoked => {
                "Your session was ended on another device. Please sign in again."
            }
            Self::SessionNotFound => "Your session no longer exists. Please sign in again.",
            Self::UserBanned => "This account has been suspended.",

            // Domain rejections
            Self::InvalidInput => "The request was malformed. Check the values and try again.",
            Self::InsufficientAp => "Not enough action points. Wait for them to regenerate.",
            Self::InsufficientCoins => "Not enough coins for this purchase.",
            Self::JobNotReady => "This job is still running. Claim it once it finishes.",
            Self::JobAlreadyRunning => "A job is already running. Claim it before starting another.",
            Self::TargetUnavailable => "That target can no longer be raided.",
            Self::RaidCapReached => "You have reached today's raid limit.",
            Self::UpgradeMaxed => "This upgrade track is already at its maximum level.",
            Self::AlreadyInClan => "You are already in a clan. Leave it before joining another.",

            // Rate limiting
            Self::RateLimitExceeded => "Too many requests. Slow down and try again shortly.",

            // Server errors
            Self::InternalError => "The server hit an internal error. Please try again.",
            Self::ServiceUnavailable => {
                "The service is temporarily unavailable. Please try again in a few moments."
            }
            Self::Unknown => "An unexpected error occurred.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_serde() {
        for code in [
            ErrorCode::InvalidRefreshToken,
            ErrorCode::InsufficientAp,
            ErrorCode::RaidCapReached,
            ErrorCode::ServiceUnavailable,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn unrecognized_code_is_unknown_and_transient() {
        let code: ErrorCode = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(code, ErrorCode::Unknown);
        assert_eq!(code.class(), ErrorClass::Transient);
    }

    #[test]
    fn refresh_rejections_are_unauthenticated() {
        assert_eq!(
            ErrorCode::RefreshTokenRevoked.class(),
            ErrorClass::Unauthenticated
        );
        assert_eq!(ErrorCode::SessionNotFound.class(), ErrorClass::Unauthenticated);
    }
}
