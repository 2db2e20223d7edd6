//! Error types for the outbox processing core.
//!
//! Handler-level failures are deliberately *not* represented here: they are
//! classified by [`crate::handler::HandlerError`] and absorbed into the
//! event's per-handler result history rather than propagated to the caller.

use std::time::Duration;

use thiserror::Error;

use crate::hook::HookError;
use crate::wakeup::WakeupError;

/// Top-level error type surfaced across the consumer API boundary.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    #[error("Wakeup error: {0}")]
    Wakeup(#[from] WakeupError),

    /// Graceful shutdown did not drain in-flight events within the allowed
    /// window. The processor still transitions to `stopped`.
    #[error("shutdown timed out after {timeout:?} with {in_flight} events still in flight")]
    ShutdownTimeout { timeout: Duration, in_flight: usize },

    /// A transaction rollback itself failed. The original failure that
    /// triggered the rollback is carried as the error source.
    #[error("transaction rollback failed: {rollback}; caused by: {cause}")]
    RollbackFailed {
        #[source]
        cause: Box<OutboxError>,
        rollback: String,
    },
}

pub type Result<T> = std::result::Result<T, OutboxError>;

/// Failures raised by storage adapters.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Transport-level failure (connection refused, pool exhausted, ...).
    /// The polling loop recovers from this by waiting one poll period.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The store rejected or failed an individual statement.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// An insert collided with an existing event id.
    #[error("duplicate event id: {0}")]
    DuplicateEvent(String),

    /// A persisted row could not be decoded into an [`crate::models::Event`].
    #[error("invalid event record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StorageError::Unavailable(err.to_string()),
            _ => StorageError::QueryFailed(err.to_string()),
        }
    }
}
