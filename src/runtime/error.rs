//! Error types for the runtime

use thiserror::Error;

/// Errors surfaced by runtime operations.
///
/// Callers can branch on the variant: `BreakerOpen` fails fast and is never
/// retried by the runtime, `Timeout` guarantees the agent slot was released,
/// `CapacityExhausted` means the request was rejected rather than queued
/// indefinitely.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Downstream agent failure, surfaced after pool-level handling
    #[error("downstream failure: {0}")]
    Downstream(String),

    /// Rejected by an open circuit breaker, no downstream call attempted
    #[error("circuit breaker open for service: {service}")]
    BreakerOpen { service: String },

    /// Operation exceeded its deadline; any acquired agent slot was released
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// No agent became available within the request deadline
    #[error("no available agent for pool: {0}")]
    CapacityExhausted(String),

    /// No pool registered for the requested agent type
    #[error("no pool configured for agent type: {0}")]
    NoSuchPool(String),

    /// Conversation memory error
    #[error("memory error: {0}")]
    Memory(String),

    /// Cache layer error (local tier; shared-tier errors degrade to misses)
    #[error("cache error: {0}")]
    Cache(String),

    /// Serialization round-trip failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid or inconsistent configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for RuntimeError {
    fn from(err: bincode::Error) -> Self {
        RuntimeError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for RuntimeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RuntimeError::Timeout(std::time::Duration::from_secs(0))
        } else {
            RuntimeError::Cache(err.to_string())
        }
    }
}

/// Result type alias for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
