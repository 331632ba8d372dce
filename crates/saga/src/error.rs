//! Saga error types.

use common::OrderId;
use event_stream::StreamError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// An event payload (or one of its raw sections) could not be parsed.
    #[error("Failed to decode saga event {field}: {source}")]
    Decode {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The saga carries a step/status pair outside the known state space.
    #[error("Invalid saga state: step {step:?}, status {status:?}")]
    InvalidState { step: String, status: String },

    /// A submitted saga failed validation.
    #[error("Invalid saga: {0}")]
    InvalidSaga(String),

    /// No saga row exists for the order.
    #[error("Saga not found: {0}")]
    SagaNotFound(OrderId),

    /// A saga with this order ID was already submitted.
    #[error("Saga already exists: {0}")]
    AlreadyExists(OrderId),

    /// The store aborted the transaction; retrying may succeed.
    #[error("Transient store conflict: {0}")]
    TransientConflict(String),

    /// The store refused the write permanently.
    #[error("Store rejected write: {0}")]
    StoreRejected(String),

    /// Transient failures persisted past the retry policy.
    #[error("Transaction failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<SagaError>,
    },

    /// Database error.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Database migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Event stream error.
    #[error("Event stream error: {0}")]
    Stream(#[from] StreamError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true if retrying the same transaction may succeed.
    ///
    /// Serialization failures and deadlocks are reported by PostgreSQL as
    /// SQLSTATE `40001` and `40P01`; broken connections and pool timeouts
    /// are retried as well.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::TransientConflict(_) => true,
            SagaError::Store(err) => is_transient_sqlx(err),
            _ => false,
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SagaError::TransientConflict("write skew".into()).is_transient());
        assert!(SagaError::Store(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!SagaError::StoreRejected("constraint".into()).is_transient());
        assert!(!SagaError::SagaNotFound(OrderId::new()).is_transient());
        assert!(!SagaError::Store(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_retries_exhausted_is_terminal() {
        let err = SagaError::RetriesExhausted {
            attempts: 3,
            source: Box::new(SagaError::TransientConflict("busy".into())),
        };
        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "Transaction failed after 3 attempt(s): Transient store conflict: busy"
        );
    }
}
