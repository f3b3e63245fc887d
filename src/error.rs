//! Error types shared by the stores, the engine and the HTTP layer.

use thiserror::Error;

/// Failure raised by any store or by the processing pipeline.
#[derive(Debug, Error)]
pub enum MockError {
    /// Malformed input: empty required field, unparseable expression, bad path parameter.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown id at any store.
    #[error("{entity} with id = {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Underlying SQLite I/O or constraint violation.
    #[error("persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// No trigger fired for an inbound message.
    #[error("no trigger matched the message")]
    Unmatched,
}

impl MockError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Whether this is a SQLite uniqueness or primary key violation.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Persistence(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.extended_code,
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            ),
            _ => false,
        }
    }
}

pub type Result<T, E = MockError> = std::result::Result<T, E>;
