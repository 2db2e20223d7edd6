//! Persistent data model for the outbox core.

mod event;

pub use event::{Event, EventCandidate, HandlerAttempt, HandlerResult, NewEvent};
