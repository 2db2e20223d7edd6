//! # Storage Adapter Contract
//!
//! The core is polymorphic over a two-sided storage capability set:
//!
//! - a **read side** ([`EventStore::events_to_process`]) that discovers
//!   candidate events without locking them, and
//! - a **transactional write side** ([`EventTransaction`]) providing the
//!   lock-skip fetch, update, and insert operations under atomic
//!   commit/rollback.
//!
//! The read side may return events currently being processed by another
//! worker; the per-event transaction rejects those by re-checking the
//! polling predicate under `FOR UPDATE SKIP LOCKED` (or an equivalent
//! lock-token claim on non-relational stores). That re-check closes the
//! TOCTOU window between polling and locking.
//!
//! Rollback contract: any error propagating out of the per-event flow must
//! trigger [`EventTransaction::rollback`]. A rollback failure is reported as
//! [`crate::error::OutboxError::RollbackFailed`] with the original error as
//! its cause.

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::StorageResult;
use crate::models::{Event, EventCandidate, NewEvent};

pub mod memory;
pub mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::{PostgresEventStore, PostgresEventStoreConfig};

/// Read side plus transaction factory.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events satisfying `processed_at IS NULL AND (backoff_until IS NULL OR
    /// backoff_until < now) AND errors < max_errors`, ordered by `timestamp`
    /// ascending and bounded by an adapter-configured batch size.
    ///
    /// Fails with [`crate::error::StorageError::Unavailable`] on transport
    /// error; the polling loop recovers by waiting one poll period. Adapters
    /// may observe the cancel token and return an empty batch early.
    async fn events_to_process(
        &self,
        max_errors: i32,
        cancel: &CancelToken,
    ) -> StorageResult<Vec<EventCandidate>>;

    /// Open a transaction scope for one event's processing attempt.
    async fn begin(&self) -> StorageResult<Box<dyn EventTransaction>>;
}

/// Transactional write side. Exactly one of [`commit`](Self::commit) or
/// [`rollback`](Self::rollback) ends the scope.
#[async_trait]
pub trait EventTransaction: Send {
    /// Acquire a row-level exclusive lock that other workers skip rather
    /// than block on, re-checking the polling predicate under the lock.
    ///
    /// Returns `None` when the event is locked elsewhere, already terminal,
    /// in backoff, or at the retry ceiling. Adapters may observe the cancel
    /// token and return `None` early.
    async fn lock_event(
        &mut self,
        id: &str,
        max_errors: i32,
        cancel: &CancelToken,
    ) -> StorageResult<Option<Event>>;

    /// Overwrite the mutable fields (`handler_results`, `errors`,
    /// `backoff_until`, `processed_at`) of a locked event.
    async fn update_event(&mut self, event: &Event) -> StorageResult<()>;

    /// Insert a new event in this transaction. Used by the max-errors hook
    /// so the follow-up event commits atomically with the terminal update.
    async fn insert_event(&mut self, event: NewEvent) -> StorageResult<()>;

    async fn commit(self: Box<Self>) -> StorageResult<()>;

    async fn rollback(self: Box<Self>) -> StorageResult<()>;
}
