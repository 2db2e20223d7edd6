//! # Max-Errors Hook
//!
//! Invoked when an event reaches its terminal-failure state, inside the same
//! transaction as the terminal update. The common use is persisting a
//! follow-up "dead letter" event through the transaction handle so it
//! commits atomically with the failure; the core does not route that event
//! anywhere.
//!
//! The hook receives a deep copy of the event, so mutating it cannot corrupt
//! the record being persisted. A hook error is logged and re-raised, which
//! rolls the transaction back: the event stays in its last pre-terminal
//! state and will be retried.

use async_trait::async_trait;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::error::StorageError;
use crate::models::Event;
use crate::storage::EventTransaction;

/// Failure inside a max-errors hook. Aborts the terminal update.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HookError {
    message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<StorageError> for HookError {
    fn from(err: StorageError) -> Self {
        HookError::new(err.to_string())
    }
}

/// Terminal-failure callback.
#[async_trait]
pub trait MaxErrorsHook: Send + Sync {
    /// `event` is a snapshot of the terminal record; `tx` is the live
    /// transaction the terminal update will commit in. The hook may insert
    /// follow-up events through it but cannot commit or roll it back.
    async fn on_max_errors(
        &self,
        event: Event,
        tx: &mut dyn EventTransaction,
        cancel: &CancelToken,
    ) -> Result<(), HookError>;
}
