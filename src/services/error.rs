use thiserror::Error;

use crate::database::manager::DatabaseError;

/// Migration workflow errors
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Chunk copy failed for '{collection}' after {attempts} attempt(s) from cursor {cursor:?}: {message}")]
    ChunkCopyFailed {
        collection: String,
        cursor: Option<String>,
        attempts: u32,
        message: String,
    },

    #[error("Verification failed for '{collection}': expected {expected} rows, found {actual}")]
    VerificationFailed {
        collection: String,
        expected: u64,
        actual: u64,
    },

    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Database(DatabaseError),
}

impl MigrationError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        MigrationError::BadRequest(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        MigrationError::Conflict(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        MigrationError::NotFound(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        MigrationError::Fatal(message.into())
    }
}

impl From<DatabaseError> for MigrationError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(msg) => MigrationError::NotFound(msg),
            DatabaseError::Conflict(msg) => MigrationError::Conflict(msg),
            other => MigrationError::Database(other),
        }
    }
}
