//! Error taxonomy shared by every adsync crate.

use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Job-level failure classes.
///
/// Key conflicts on upsert never show up here: the upsert layer resolves them
/// by overwriting the stored row.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("permanent failure: {0}")]
    PermanentFailure(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

/// What the worker should do with a job that returned a given error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with exponential backoff until attempts run out.
    Backoff,
    /// Retry honoring the upstream advisory delay when one was given.
    RateLimit,
    /// Fail the job and deactivate the connection.
    Fatal,
    /// Fail the job without touching the connection.
    Reject,
}

impl SyncError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TransientNetwork(_) | Self::Storage(_) | Self::Timeout(_) => ErrorClass::Backoff,
            Self::RateLimited { .. } => ErrorClass::RateLimit,
            Self::Auth(_) => ErrorClass::Fatal,
            Self::Validation(_) | Self::PermanentFailure(_) | Self::NotFound(_) => {
                ErrorClass::Reject
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Backoff | ErrorClass::RateLimit)
    }

    /// Only auth failures and exhausted retries reach the user; the rest is
    /// operational noise absorbed by retries.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::PermanentFailure(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_retry_policy() {
        assert_eq!(
            SyncError::TransientNetwork("reset".into()).class(),
            ErrorClass::Backoff
        );
        assert_eq!(SyncError::Storage("pool".into()).class(), ErrorClass::Backoff);
        assert_eq!(
            SyncError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
                message: "slow down".into()
            }
            .class(),
            ErrorClass::RateLimit
        );
        assert_eq!(SyncError::Auth("expired".into()).class(), ErrorClass::Fatal);
        assert!(!SyncError::validation("bad").is_retryable());
    }

    #[test]
    fn only_auth_and_permanent_are_user_visible() {
        assert!(SyncError::Auth("revoked".into()).is_user_visible());
        assert!(SyncError::PermanentFailure("exhausted".into()).is_user_visible());
        assert!(!SyncError::TransientNetwork("x".into()).is_user_visible());
        assert!(!SyncError::validation("x").is_user_visible());
    }
}
