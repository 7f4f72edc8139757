//! Error types for the database layer.

use thiserror::Error;

use crate::sql_guard::SqlGuardError;

/// Database operation result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness or ownership rule violated (duplicate key, frozen version, ...)
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// A per-form publish lease is held by someone else
    #[error("Locked: {0}")]
    Locked(String),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Caller-supplied value rejected before reaching SQL
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Identifier or literal refused by the SQL guard
    #[error("Unsafe SQL input: {0}")]
    Guard(#[from] SqlGuardError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// One statement of a DDL script failed; the whole script was rolled back.
    #[error("DDL statement {index} failed: {source}")]
    Ddl {
        index: usize,
        statement: String,
        #[source]
        source: sqlx::Error,
    },

    /// Stored timestamp could not be parsed
    #[error("Invalid timestamp in store: {0}")]
    Timestamp(String),

    #[error("Invalid database URL: {0}")]
    InvalidUrl(String),

    #[error("Database type {0} not compiled in. Rebuild with the '{1}' feature.")]
    NotCompiled(String, String),
}

impl DbError {
    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a constraint error.
    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// True if the error is the store rejecting a duplicate key.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Sqlx(err) => sqlx_unique_violation(err),
            Self::Constraint(_) => true,
            _ => false,
        }
    }
}

pub(crate) fn sqlx_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}
