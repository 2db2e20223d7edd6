//! # outbox-core
//!
//! Execution core of a transactional outbox event processor.
//!
//! Applications insert events into an append-only table inside their
//! business transactions; this crate drains that table and invokes named,
//! user-defined side-effect handlers per event type with **at-least-once**
//! delivery. Handlers must be idempotent.
//!
//! ## What the core provides
//!
//! - **Per-handler result tracking**: each handler's success, poisoning,
//!   and full error history persist on the event, so a handler that
//!   succeeded once is never re-invoked, even across restarts.
//! - **Retry with backoff**: capped-exponential by default, replaceable,
//!   reconciled latest-wins with handler-provided backoff hints.
//! - **Safe horizontal scaling**: candidate rows are re-fetched under
//!   `FOR UPDATE SKIP LOCKED`, so any number of workers can share a table.
//! - **Bounded concurrency**: separate limits for events in flight and for
//!   handlers within one event, with poll-side backpressure.
//! - **Push wakeups**: an optional emitter (Postgres LISTEN/NOTIFY
//!   included) short-circuits poll latency; a fallback timer guarantees
//!   progress if the push channel dies.
//! - **Graceful shutdown**: one cancel token across polling, dispatch, and
//!   handlers, with a bounded-time drain.
//!
//! The processor never produces events and never deletes them; ordering
//! between events is not guaranteed. See [`processor::Processor`] for the
//! entry point.

pub mod backoff;
pub mod cancel;
pub mod config;
pub mod error;
pub mod handler;
pub mod hook;
pub mod logging;
pub mod models;
pub mod processor;
pub mod registry;
pub mod storage;
pub mod wakeup;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use cancel::CancelToken;
pub use config::ProcessorConfig;
pub use error::{OutboxError, Result, StorageError};
pub use handler::{handler_fn, EventHandler, HandlerError};
pub use hook::{HookError, MaxErrorsHook};
pub use models::{Event, EventCandidate, HandlerAttempt, HandlerResult, NewEvent};
pub use processor::{Processor, ProcessorBuilder, ProcessorState};
pub use registry::HandlerRegistry;
pub use storage::{EventStore, EventTransaction, MemoryEventStore, PostgresEventStore};
pub use wakeup::{WakeupEmitter, WakeupSignal};
