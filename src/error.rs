//! Error types for the task bot.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl DatabaseError {
    /// Classify a libSQL error, picking out unique-index violations.
    pub(crate) fn from_libsql(context: &str, err: libsql::Error) -> Self {
        let message = err.to_string();
        if message.contains("UNIQUE constraint failed") {
            Self::UniqueViolation(format!("{context}: {message}"))
        } else {
            Self::Query(format!("{context}: {message}"))
        }
    }
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Send on channel {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

/// Capability check failures.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("You are not registered yet. Send /start to request access.")]
    Unregistered,

    #[error("Your registration is still waiting for approval.")]
    Pending,

    #[error("You don't have permission to do that.")]
    Forbidden,

    #[error("Role change not allowed: {0}")]
    InvalidTransition(String),

    #[error("No user with alias '{0}'.")]
    UnknownAlias(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Failures of a dialog session.
///
/// Every variant except `AlreadyActive` and `NoActiveSession` means the
/// session has been destroyed.
#[derive(Debug, thiserror::Error)]
pub enum DialogError {
    #[error("Another flow is already in progress. Finish it or send /cancel.")]
    AlreadyActive,

    #[error("No active flow")]
    NoActiveSession,

    #[error("{0}")]
    Validation(String),

    #[error("{entity} '{key}' not found")]
    NotFound { entity: String, key: String },

    #[error("Something went wrong while saving. Please try again.")]
    Store(#[source] DatabaseError),

    #[error("This dialog got out of sync ({0}). Please start again.")]
    OutOfSync(String),
}

impl DialogError {
    pub fn not_found(entity: &str, key: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            key: key.to_string(),
        }
    }
}

impl From<DatabaseError> for DialogError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound { entity, id } => Self::NotFound { entity, key: id },
            other => Self::Store(other),
        }
    }
}
