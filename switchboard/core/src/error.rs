//! Error Taxonomy
//!
//! Provider adapters report failures as a classified [`AdapterError`]. The
//! routing engine consumes `Transient`, `RateLimited` and
//! `AuthenticationFailed` into its fallback loop and surfaces only
//! `ContentRejected` and exhaustion to callers, as a [`RouterError`] that
//! lists every attempt and why it failed.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Capability;

// ============================================================================
// Error Classification
// ============================================================================

/// Classification of a failed provider call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network failure, timeout or 5xx; safe to retry elsewhere immediately
    Transient,

    /// Quota or rate limit hit (429-equivalent)
    RateLimited,

    /// Credential invalid or revoked
    AuthenticationFailed,

    /// The request itself was refused; no other provider will help
    ContentRejected,

    /// The caller cancelled while the call was in flight
    Cancelled,
}

impl ErrorClass {
    /// Whether this failure says something about the health of the endpoint
    ///
    /// `ContentRejected` is the caller's problem, not the provider's.
    #[must_use]
    pub fn is_endpoint_failure(&self) -> bool {
        !matches!(self, Self::ContentRejected)
    }

    /// Whether the fallback loop may continue after this failure
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient | Self::RateLimited | Self::AuthenticationFailed
        )
    }

    /// Stable snake_case name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::AuthenticationFailed => "authentication_failed",
            Self::ContentRejected => "content_rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Adapter Errors
// ============================================================================

/// A classified failure returned by a provider adapter
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{class}: {message}")]
pub struct AdapterError {
    /// Failure class
    pub class: ErrorClass,
    /// Human-readable detail from the provider
    pub message: String,
}

impl AdapterError {
    /// Create an error of the given class
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Network failure, timeout or server error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    /// Provider reported a rate limit
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::RateLimited, message)
    }

    /// Provider rejected the credential
    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::AuthenticationFailed, message)
    }

    /// Provider refused the request content
    pub fn content_rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::ContentRejected, message)
    }
}

// ============================================================================
// Attempt Records
// ============================================================================

/// One failed provider call within a request's fallback sequence
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// 1-based attempt number within the request
    pub attempt: u32,
    /// Provider that was called
    pub provider: String,
    /// Credential id (never the secret)
    pub credential: String,
    /// Model that was called
    pub model: String,
    /// Failure class
    pub class: ErrorClass,
    /// Failure detail
    pub message: String,
    /// Time spent on the call
    pub latency: Duration,
}

impl fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {}/{}/{}: {}: {}",
            self.attempt, self.provider, self.credential, self.model, self.class, self.message
        )
    }
}

/// Why a candidate was passed over without a call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No credential had quota left for the model
    QuotaExhausted,
    /// The circuit for the credential/model was open
    CircuitOpen,
    /// Quota ran out between selection and the call
    QuotaRaced,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaExhausted => f.write_str("quota exhausted"),
            Self::CircuitOpen => f.write_str("circuit open"),
            Self::QuotaRaced => f.write_str("quota taken concurrently"),
        }
    }
}

/// A candidate passed over without a call
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedCandidate {
    /// Provider id
    pub provider: String,
    /// Credential id, when one was selected before skipping
    pub credential: Option<String>,
    /// Model id
    pub model: String,
    /// Why it was skipped
    pub reason: SkipReason,
}

impl fmt::Display for SkippedCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.credential {
            Some(credential) => write!(
                f,
                "{}/{}/{}: {}",
                self.provider, credential, self.model, self.reason
            ),
            None => write!(f, "{}/*/{}: {}", self.provider, self.model, self.reason),
        }
    }
}

// ============================================================================
// Router Errors
// ============================================================================

/// Errors surfaced to callers of [`Router::execute`](crate::routing::Router::execute)
#[derive(Clone, Debug, Error)]
pub enum RouterError {
    /// The request content was refused; it is not retried elsewhere
    #[error("request rejected by {}/{}: {}", .attempt.provider, .attempt.model, .attempt.message)]
    ContentRejected {
        /// The attempt that was rejected
        attempt: AttemptRecord,
        /// Earlier failed attempts in the same request
        previous: Vec<AttemptRecord>,
    },

    /// Every candidate failed or was unavailable
    #[error("{}", render_exhausted(.capability, .attempts, .skipped))]
    Exhausted {
        /// Capability that was requested
        capability: Capability,
        /// Every failed call, in order
        attempts: Vec<AttemptRecord>,
        /// Candidates passed over without a call
        skipped: Vec<SkippedCandidate>,
    },

    /// The caller cancelled the request
    #[error("request cancelled after {} failed attempt(s)", .attempts.len())]
    Cancelled {
        /// Failed calls before and including the interrupted one
        attempts: Vec<AttemptRecord>,
    },
}

impl RouterError {
    /// All recorded attempts, whatever the variant
    #[must_use]
    pub fn attempts(&self) -> Vec<&AttemptRecord> {
        match self {
            Self::ContentRejected { attempt, previous } => {
                previous.iter().chain(std::iter::once(attempt)).collect()
            }
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts } => {
                attempts.iter().collect()
            }
        }
    }
}

fn render_exhausted(
    capability: &Capability,
    attempts: &[AttemptRecord],
    skipped: &[SkippedCandidate],
) -> String {
    if attempts.is_empty() && skipped.is_empty() {
        return format!("no eligible provider for {capability} requests");
    }

    let mut out = format!(
        "all candidates for {capability} failed ({} attempt(s), {} skipped)",
        attempts.len(),
        skipped.len()
    );
    for attempt in attempts {
        out.push_str("\n  ");
        out.push_str(&attempt.to_string());
    }
    for skip in skipped {
        out.push_str("\n  skipped ");
        out.push_str(&skip.to_string());
    }
    out
}
