//! # Event Handlers
//!
//! User-defined side-effect capabilities invoked per event. Handlers are
//! registered by name under an event type (see [`crate::registry`]) and are
//! contractually required to be idempotent: delivery is at-least-once and a
//! handler may observe the same event more than once.
//!
//! Handler failures never cross the consumer API boundary. They are
//! classified by [`HandlerError`] and absorbed into the event's per-handler
//! result history:
//!
//! - **Transient** (the default): the attempt is recorded and the event is
//!   retried with backoff.
//! - **Unprocessable**: the handler can never succeed for this event; it is
//!   marked terminally failed while the event's other handlers proceed.
//! - **Backoff**: transient, plus an explicit lower bound on the next retry
//!   instant, reconciled latest-wins with the configured backoff policy.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::models::Event;

/// Classified handler failure.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// May succeed on retry. Any failure that is not one of the other
    /// variants belongs here.
    #[error("{0}")]
    Transient(String),

    /// Will never succeed for this event; stop retrying this handler.
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// Transient, with an explicit earliest-retry instant supplied by the
    /// handler (a rate-limit window, an upstream Retry-After, ...).
    #[error("retry no sooner than {backoff_until}: {message}")]
    Backoff {
        message: String,
        backoff_until: DateTime<Utc>,
    },
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient(message.into())
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        HandlerError::Unprocessable(message.into())
    }

    pub fn backoff(message: impl Into<String>, backoff_until: DateTime<Utc>) -> Self {
        HandlerError::Backoff {
            message: message.into(),
            backoff_until,
        }
    }
}

/// A named side-effect capability dispatched per event.
///
/// The cancel token signals processor shutdown; long-running handlers should
/// observe it cooperatively. Ignoring it only affects drain latency, never
/// correctness.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event, cancel: &CancelToken) -> Result<(), HandlerError>;
}

/// Adapt an async closure into an [`EventHandler`].
///
/// ```
/// use outbox_core::handler::{handler_fn, HandlerError};
///
/// let handler = handler_fn(|event, _cancel| async move {
///     if event.data.get("amount").is_none() {
///         return Err(HandlerError::unprocessable("payload has no amount"));
///     }
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event, CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event, CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: &Event, cancel: &CancelToken) -> Result<(), HandlerError> {
        (self.0)(event.clone(), cancel.clone()).await
    }
}
