//! Database error types.

use thiserror::Error;

/// SQLite primary result codes that signal lock contention.
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// SQLx error (connection, query, etc.)
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Migration error
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON column could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record not found
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Record already exists
    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },
}

impl DatabaseError {
    /// Returns `true` when SQLite rejected the statement because another
    /// connection holds the write lock. The whole transaction can be retried.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Sqlx(sqlx::Error::Database(db_err)) => {
                let code = db_err.code();
                let primary = code.as_deref().map(primary_code);
                matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED))
                    || db_err.message().contains("database is locked")
            }
            Self::Sqlx(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

/// Extended result codes carry the primary code in the low byte.
fn primary_code(code: &str) -> &str {
    match code.parse::<u32>() {
        Ok(n) if n & 0xff == 5 => SQLITE_BUSY,
        Ok(n) if n & 0xff == 6 => SQLITE_LOCKED,
        _ => code,
    }
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;
