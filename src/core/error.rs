//! Error taxonomy for rate acquisition.

use std::time::Duration;

/// Failure reported by a single rate provider adapter.
///
/// These never reach pricing callers: the fallback chain absorbs them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("upstream rate limited: {0}")]
    RateLimited(String),

    #[error("upstream malformed payload: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Transient failures are worth an immediate retry; a malformed
    /// payload will come back identical, so it is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable(_) | ProviderError::RateLimited(_)
        )
    }

    /// Classifies a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode, provider: &str) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ProviderError::RateLimited(format!("{provider} returned {status}"))
        } else {
            ProviderError::Unavailable(format!("{provider} returned {status}"))
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ProviderError::Malformed(err.to_string());
        }
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return ProviderError::RateLimited(err.to_string());
            }
        }
        // Timeouts, connect failures and body read errors all mean the
        // upstream could not deliver.
        ProviderError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Malformed(err.to_string())
    }
}

/// A caller's bounded wait for an in-flight refresh expired.
///
/// Only the wait is abandoned; the refresh keeps running for other waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timed out after {waited:?} waiting for exchange-rate refresh")]
pub struct RefreshTimeout {
    pub waited: Duration,
}
