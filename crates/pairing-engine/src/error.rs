//! Error types for engine operations.

use std::time::Duration;

use database::DatabaseError;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while accounting time or pairing users.
///
/// Every variant is recoverable by the caller: retry, buy credits, upgrade,
/// watch an ad, or start over. [`EngineError::is_retriable`] identifies the
/// ones the engine retries on its own before surfacing them.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The user has no free or paid time left.
    #[error("no chat time remaining")]
    InsufficientTime,

    /// Not enough spendable credits.
    #[error("insufficient credits: need {required}, have {available}")]
    InsufficientCredits { required: u64, available: u64 },

    /// Not enough giftable credits.
    #[error("insufficient giftable credits: need {required}, have {available}")]
    InsufficientGiftableCredits { required: u64, available: u64 },

    /// The operation requires an active premium subscription.
    #[error("premium subscription required")]
    NotPremium,

    /// The skip limit was reached; an ad must be watched first.
    #[error("skip limit reached, ad required")]
    SkipLimitReached,

    /// No active session to resume.
    #[error("no active session")]
    NoActiveSession,

    /// Another searcher claimed the candidate first. Re-scan.
    #[error("ticket was claimed by another searcher")]
    TicketRaceLost,

    /// The store rejected the transaction because of a concurrent writer.
    #[error("transaction conflict")]
    TransactionConflict,

    /// The user is already in an active session.
    #[error("user already has an active session")]
    ActiveSessionExists,

    /// The search ticket was withdrawn before a partner was found.
    #[error("search cancelled")]
    SearchCancelled,

    /// No partner was found before the search deadline.
    #[error("no partner found within {0:?}")]
    SearchTimedOut(Duration),

    /// Account does not exist.
    #[error("account not found: {0}")]
    AccountNotFound(String),

    /// Account already exists.
    #[error("account already exists: {0}")]
    AccountExists(String),

    /// Session does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    /// The user is not a participant of the session.
    #[error("user {user_id} is not a participant of session {session_id}")]
    NotParticipant { session_id: Uuid, user_id: String },

    /// The session has already ended.
    #[error("session {0} is no longer active")]
    SessionInactive(Uuid),

    /// Rating is not allowed for this session.
    #[error("rating not allowed: {0}")]
    RatingNotAllowed(String),

    /// Malformed request (zero amount, self-gift, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The verified product is not in the catalog.
    #[error("unknown product: {0}")]
    UnknownProduct(String),

    /// Receipt verification failed.
    #[error("payment rejected: {0}")]
    PaymentRejected(String),

    /// Notification delivery failed.
    #[error("notification failed: {0}")]
    NotificationFailed(String),

    /// A stored record could not be decoded.
    #[error("corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    /// Persistence failure.
    #[error("storage error: {0}")]
    Storage(#[source] DatabaseError),
}

impl EngineError {
    /// Returns `true` for errors that are resolved by simply trying again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::TicketRaceLost | Self::TransactionConflict)
    }
}

impl From<DatabaseError> for EngineError {
    fn from(err: DatabaseError) -> Self {
        if err.is_busy() {
            return Self::TransactionConflict;
        }
        match err {
            DatabaseError::NotFound {
                entity: "Account",
                id,
            } => Self::AccountNotFound(id),
            DatabaseError::AlreadyExists {
                entity: "Account",
                id,
            } => Self::AccountExists(id),
            other => Self::Storage(other),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        assert!(EngineError::TicketRaceLost.is_retriable());
        assert!(EngineError::TransactionConflict.is_retriable());
        assert!(!EngineError::InsufficientTime.is_retriable());
        assert!(!EngineError::SkipLimitReached.is_retriable());
    }

    #[test]
    fn test_database_not_found_maps_to_account_not_found() {
        let err: EngineError = DatabaseError::NotFound {
            entity: "Account",
            id: "alice".to_string(),
        }
        .into();
        assert!(matches!(err, EngineError::AccountNotFound(id) if id == "alice"));

        let err: EngineError = DatabaseError::NotFound {
            entity: "ChatSession",
            id: "s1".to_string(),
        }
        .into();
        assert!(matches!(err, EngineError::Storage(_)));
    }
}
