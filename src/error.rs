use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for routing core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the routing core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Request failed schema or content validation
    #[error("validation failed: {0}")]
    Validation(String),

    /// Request rejected by the safety rule set
    #[error("rejected by policy: {0}")]
    PolicyRejection(String),

    /// Dispatcher queue above the high-water mark; submission refused
    #[error("system overloaded, submission refused")]
    Overloaded,

    /// No routable agent satisfies the request, even after fallback
    #[error("no agent available")]
    NoAgentAvailable,

    /// The target backend's circuit breaker is open and no fallback remained
    #[error("circuit open for backend {0}")]
    CircuitOpen(String),

    /// Deadline passed at a stage boundary or mid-attempt
    #[error("deadline exceeded")]
    TimeoutExceeded,

    /// Caller cancelled the request
    #[error("request cancelled")]
    Cancelled,

    /// Backend returned a non-recoverable error
    #[error("backend failed: {0}")]
    BackendFatal(String),

    /// Every retry and fallback was exhausted on retryable failures
    #[error("retries exhausted after {attempts} attempt(s): {message}")]
    RetriesExhausted { attempts: u32, message: String },

    /// Anything unexpected; carries context for operator correlation
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Stable lowercase tag for events and metrics labels.
    pub fn tag(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::PolicyRejection(_) => "policy_rejection",
            CoreError::Overloaded => "overloaded",
            CoreError::NoAgentAvailable => "no_agent_available",
            CoreError::CircuitOpen(_) => "circuit_open",
            CoreError::TimeoutExceeded => "timeout_exceeded",
            CoreError::Cancelled => "cancelled",
            CoreError::BackendFatal(_) => "backend_fatal",
            CoreError::RetriesExhausted { .. } => "retries_exhausted",
            CoreError::Internal(_) => "internal",
        }
    }
}

/// Classification tag a provider must attach to every error it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient failure; safe to retry against the same backend
    Retryable,
    /// The request itself is unserviceable; retrying cannot help
    FatalClient,
    /// The backend is broken; try elsewhere
    FatalServer,
    /// Backend throttled the call
    RateLimited,
    /// The attempt exceeded its time budget
    Timeout,
    /// Credentials rejected; this backend is unusable as configured
    AuthFailure,
}

impl ErrorKind {
    /// Whether an exponential-backoff retry against the same backend makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Retryable | ErrorKind::RateLimited | ErrorKind::Timeout
        )
    }

    /// Whether the failure should count against the backend's circuit breaker.
    ///
    /// Client-side errors and auth misconfiguration say nothing about the
    /// backend's health.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(self, ErrorKind::FatalClient | ErrorKind::AuthFailure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Retryable => "retryable",
            ErrorKind::FatalClient => "fatal_client",
            ErrorKind::FatalServer => "fatal_server",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::AuthFailure => "auth_failure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tagged error returned by a provider implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retryable, message)
    }

    pub fn fatal_client(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FatalClient, message)
    }

    pub fn fatal_server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FatalServer, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn auth_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailure, message)
    }
}
