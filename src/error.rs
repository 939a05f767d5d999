//! Error types for the triage policy engine.

use std::time::Duration;

use crate::policy::types::Decision;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Proposer error: {0}")]
    Proposer(#[from] ProposerError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors raised by a `DecisionStore` backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Record not found: {collection} with id {id}")]
    NotFound { collection: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Strategy proposer errors. Callers map every variant to a documented fallback.
#[derive(Debug, thiserror::Error)]
pub enum ProposerError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Proposer timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the decision engine and the learning scheduler.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The decision was made but could not be recorded. The decision is still
    /// usable; the missing record means later feedback for it will be ignored.
    #[error("Decision {} made but not persisted: {source}", decision.id)]
    UnpersistedDecision {
        decision: Box<Decision>,
        source: StoreError,
    },

    #[error("A learning cycle is already in progress")]
    CycleInProgress,

    #[error("Learning cycle panicked: {0}")]
    CyclePanicked(String),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
