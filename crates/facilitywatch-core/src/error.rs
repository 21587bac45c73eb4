//! Error types for FacilityWatch

use thiserror::Error;

use crate::models::AlertStatus;

/// Result type alias using FacilityWatch's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for FacilityWatch operations
#[derive(Error, Debug)]
pub enum Error {
    /// Bad rule definition or request input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entity absent or outside the caller's tenant
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Illegal alert state transition
    #[error("Cannot move alert from {current} to {requested}")]
    InvalidTransition {
        current: AlertStatus,
        requested: AlertStatus,
    },

    /// Other conflicting request (duplicate acknowledgment, lost update race)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Reading store failure or timeout during a single rule check
    #[error("Transient evaluation error: {0}")]
    TransientEvaluation(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(String),

    /// Notification delivery error
    #[error("Notification error: {0}")]
    Notification(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a transition conflict naming both states
    pub fn transition(current: AlertStatus, requested: AlertStatus) -> Self {
        Self::InvalidTransition { current, requested }
    }

    /// Create a free-form conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a transient evaluation error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientEvaluation(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is a conflict of either kind
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. } | Self::Conflict(_))
    }
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Redis(err.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::Redis(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
