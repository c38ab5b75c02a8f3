//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a pairing code was refused.
///
/// These are the only registry failures surfaced to the party presenting a
/// code. `InvalidCode` is also returned for codes that do not exist, so a
/// caller cannot probe for live codes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingError {
    #[error("invalid pairing code")]
    InvalidCode,

    #[error("pairing code has expired")]
    CodeExpired,

    #[error("too many attempts for this pairing code")]
    AttemptsExceeded,

    #[error("too many outstanding pairing codes")]
    RateLimitExceeded,
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Pairing rejected: {0}")]
    Pairing(#[from] PairingError),

    #[error("Not permitted: {0}")]
    NotPermitted(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn not_permitted(msg: impl Into<String>) -> Self {
        Self::NotPermitted(msg.into())
    }

    /// The pairing rejection carried by this error, if any.
    pub fn pairing(&self) -> Option<PairingError> {
        match self {
            Self::Pairing(e) => Some(*e),
            _ => None,
        }
    }

    /// Message safe to show to an untrusted requester.
    ///
    /// Pairing failures keep their specific wording; everything else collapses
    /// into a generic rejection so storage details never leak to chat users.
    pub fn user_message(&self) -> String {
        match self {
            Self::Pairing(e) => e.to_string(),
            Self::NotPermitted(_) => "you are not allowed to do that".to_string(),
            Self::NotFound { .. } => "not found".to_string(),
            _ => "request could not be completed".to_string(),
        }
    }
}
