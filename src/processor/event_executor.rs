//! # Event Executor
//!
//! The per-event transactional state machine. Each candidate produced by
//! polling runs through one attempt:
//!
//! 1. Cheap gate: cancelled, or the polled `errors` snapshot already at the
//!    ceiling (the read side should not have returned it).
//! 2. Open a storage transaction and re-fetch under `FOR UPDATE SKIP
//!    LOCKED`. `None` means another worker owns the row, or it completed or
//!    entered backoff since polling; commit empty and move on.
//! 3. Re-check terminality under the lock.
//! 4. Resolve the handler group. A missing group is a caller error and
//!    poisons the event (error count jumps straight to the ceiling); an
//!    empty group completes the event immediately.
//! 5. Dispatch the not-yet-terminal handlers concurrently, bounded, without
//!    fail-fast, and merge the classified outcomes into `handler_results`.
//! 6. Terminal sweep: when every handler still lacking `processed_at` is
//!    unprocessable, nothing is left to retry and the event fails now
//!    rather than after more ticks.
//! 7. Compute the next state (terminal success, terminal failure + hook, or
//!    backoff with latest-wins hint reconciliation), persist, commit.
//!
//! Any error escaping the flow rolls the transaction back, so a failed
//! attempt leaves the event exactly as the previous commit did.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::cancel::CancelToken;
use crate::error::{OutboxError, Result};
use crate::handler::HandlerError;
use crate::hook::MaxErrorsHook;
use crate::models::{Event, EventCandidate, HandlerAttempt, HandlerResult};
use crate::registry::{HandlerGroup, HandlerRegistry};
use crate::storage::{EventStore, EventTransaction};

/// Result of one processing attempt, as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessOutcome {
    /// Nothing was done: cancelled, stale candidate, or the row was not
    /// lockable. The event stays eligible for a later poll.
    Skipped,
    /// An attempt committed. `retry_at` carries the persisted
    /// `backoff_until` for non-terminal outcomes so the dispatcher can
    /// schedule a self-wakeup.
    Processed {
        retry_at: Option<DateTime<Utc>>,
    },
}

pub(crate) struct EventExecutor {
    store: Arc<dyn EventStore>,
    registry: Arc<HandlerRegistry>,
    backoff: Arc<dyn BackoffPolicy>,
    hook: Option<Arc<dyn MaxErrorsHook>>,
    max_errors: i32,
    max_handler_concurrency: usize,
}

impl EventExecutor {
    pub(crate) fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<HandlerRegistry>,
        backoff: Arc<dyn BackoffPolicy>,
        hook: Option<Arc<dyn MaxErrorsHook>>,
        max_errors: i32,
        max_handler_concurrency: usize,
    ) -> Self {
        Self {
            store,
            registry,
            backoff,
            hook,
            max_errors,
            max_handler_concurrency,
        }
    }

    /// Run one attempt for a polled candidate.
    pub(crate) async fn process_event(
        &self,
        candidate: &EventCandidate,
        cancel: &CancelToken,
    ) -> Result<ProcessOutcome> {
        if cancel.is_cancelled() {
            debug!(event_id = %candidate.id, "skipping event, shutdown in progress");
            return Ok(ProcessOutcome::Skipped);
        }
        if candidate.errors >= self.max_errors {
            warn!(
                event_id = %candidate.id,
                errors = candidate.errors,
                "candidate already at the retry ceiling, the read side should not have returned it"
            );
            return Ok(ProcessOutcome::Skipped);
        }

        let mut tx = self.store.begin().await?;
        match self.process_locked(tx.as_mut(), candidate, cancel).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(cause) => match tx.rollback().await {
                Ok(()) => Err(cause),
                Err(rollback_err) => Err(OutboxError::RollbackFailed {
                    cause: Box::new(cause),
                    rollback: rollback_err.to_string(),
                }),
            },
        }
    }

    async fn process_locked(
        &self,
        tx: &mut dyn EventTransaction,
        candidate: &EventCandidate,
        cancel: &CancelToken,
    ) -> Result<ProcessOutcome> {
        let Some(mut event) = tx
            .lock_event(&candidate.id, self.max_errors, cancel)
            .await?
        else {
            debug!(
                event_id = %candidate.id,
                "event is locked elsewhere or no longer eligible"
            );
            return Ok(ProcessOutcome::Skipped);
        };

        // The lock re-check already excludes terminal rows; this guards the
        // same conditions against adapters with weaker predicates.
        if event.processed_at.is_some() || event.errors >= self.max_errors {
            debug!(event_id = %event.id, "event became terminal between poll and lock");
            return Ok(ProcessOutcome::Skipped);
        }

        let correlation_id = event.correlation_id.clone().unwrap_or_default();
        let mut errored = false;
        let mut backoff_hints: Vec<DateTime<Utc>> = Vec::new();

        match self.registry.group(&event.event_type) {
            None => {
                warn!(
                    correlation_id = %correlation_id,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "no handler group registered for event type, poisoning event"
                );
                event.errors = self.max_errors;
                errored = true;
            }
            Some(group) => {
                for (name, outcome) in self.dispatch_handlers(&event, group, cancel).await {
                    let result = event.handler_results.entry(name.clone()).or_default();
                    match outcome {
                        Ok(()) => {
                            debug!(
                                correlation_id = %correlation_id,
                                event_id = %event.id,
                                handler = %name,
                                "handler succeeded"
                            );
                            result.processed_at = Some(Utc::now());
                        }
                        Err(err) => {
                            errored = true;
                            match &err {
                                HandlerError::Unprocessable(_) => {
                                    warn!(
                                        correlation_id = %correlation_id,
                                        event_id = %event.id,
                                        handler = %name,
                                        error = %err,
                                        "handler is unprocessable for this event, it will not be retried"
                                    );
                                    result.unprocessable_at = Some(Utc::now());
                                }
                                HandlerError::Backoff { backoff_until, .. } => {
                                    warn!(
                                        correlation_id = %correlation_id,
                                        event_id = %event.id,
                                        handler = %name,
                                        error = %err,
                                        "handler requested backoff"
                                    );
                                    backoff_hints.push(*backoff_until);
                                }
                                HandlerError::Transient(_) => {
                                    warn!(
                                        correlation_id = %correlation_id,
                                        event_id = %event.id,
                                        handler = %name,
                                        error = %err,
                                        "handler failed"
                                    );
                                }
                            }
                            result.errors.push(HandlerAttempt {
                                message: err.to_string(),
                                occurred_at: Utc::now(),
                            });
                        }
                    }
                }

                if all_remaining_unprocessable(&event, group) {
                    warn!(
                        correlation_id = %correlation_id,
                        event_id = %event.id,
                        "every remaining handler is unprocessable, nothing left to retry"
                    );
                    event.errors = self.max_errors;
                    errored = true;
                }
            }
        }

        let retry_at = if !errored {
            event.backoff_until = None;
            event.processed_at = Some(Utc::now());
            info!(
                correlation_id = %correlation_id,
                event_id = %event.id,
                errors = event.errors,
                "event processed"
            );
            None
        } else {
            event.errors = event.errors.saturating_add(1).min(self.max_errors);
            if event.errors >= self.max_errors {
                event.backoff_until = None;
                event.processed_at = Some(Utc::now());
                warn!(
                    correlation_id = %correlation_id,
                    event_id = %event.id,
                    errors = event.errors,
                    "event reached the retry ceiling, terminal failure"
                );
                if let Some(hook) = &self.hook {
                    // The hook gets its own copy so it cannot mutate the
                    // record being persisted.
                    if let Err(hook_err) = hook.on_max_errors(event.clone(), tx, cancel).await {
                        error!(
                            correlation_id = %correlation_id,
                            event_id = %event.id,
                            error = %hook_err,
                            "max-errors hook failed, aborting terminal update"
                        );
                        return Err(OutboxError::Hook(hook_err));
                    }
                }
                None
            } else {
                let mut next_backoff = self.backoff.next_retry_at(event.errors as u32);
                // Latest wins across the policy output and every hint: a
                // shorter hint never shortens the effective backoff.
                for hint in &backoff_hints {
                    if *hint > next_backoff {
                        next_backoff = *hint;
                    }
                }
                event.backoff_until = Some(next_backoff);
                info!(
                    correlation_id = %correlation_id,
                    event_id = %event.id,
                    errors = event.errors,
                    backoff_until = %next_backoff,
                    "event attempt failed, retry scheduled"
                );
                Some(next_backoff)
            }
        };

        tx.update_event(&event).await?;
        Ok(ProcessOutcome::Processed { retry_at })
    }

    /// Invoke the not-yet-terminal handlers of `group` concurrently, bounded
    /// by `max_handler_concurrency`, waiting for all of them (no fail-fast).
    async fn dispatch_handlers(
        &self,
        event: &Event,
        group: &HandlerGroup,
        cancel: &CancelToken,
    ) -> Vec<(String, std::result::Result<(), HandlerError>)> {
        let semaphore = Arc::new(Semaphore::new(self.max_handler_concurrency));
        let mut invocations = Vec::new();

        for registered in group.iter() {
            if event
                .handler_results
                .get(&registered.name)
                .map_or(false, HandlerResult::is_terminal)
            {
                debug!(
                    event_id = %event.id,
                    handler = %registered.name,
                    "handler already terminal for this event, skipping"
                );
                continue;
            }

            let name = registered.name.clone();
            let handler = Arc::clone(&registered.handler);
            let event = event.clone();
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);
            invocations.push(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return (name, Err(HandlerError::transient("handler pool closed"))),
                };
                let outcome = handler.handle(&event, &cancel).await;
                (name, outcome)
            });
        }

        join_all(invocations).await
    }
}

/// True when at least one handler still lacks `processed_at` and every such
/// handler carries `unprocessable_at`.
fn all_remaining_unprocessable(event: &Event, group: &HandlerGroup) -> bool {
    let mut any_remaining = false;
    for name in group.names() {
        let result = event.handler_results.get(name);
        if result.map_or(false, |r| r.processed_at.is_some()) {
            continue;
        }
        any_remaining = true;
        if !result.map_or(false, |r| r.unprocessable_at.is_some()) {
            return false;
        }
    }
    any_remaining
}
