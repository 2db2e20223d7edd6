//! # Dispatcher
//!
//! Bounded-concurrency execution of per-event attempts.
//!
//! - A semaphore of `max_event_concurrency` permits bounds simultaneous
//!   attempts.
//! - A shared in-flight id set deduplicates: the polling loop filters out
//!   ids already present, and tasks remove themselves on completion, on
//!   error, and on cancelled waits alike.
//! - `max_queued_events` is the backpressure threshold the polling loop
//!   consults before a tick; it caps queued-plus-running work.
//! - Non-terminal attempts report their persisted `backoff_until` through
//!   the retry channel so the poller can schedule a self-wakeup at that
//!   instant instead of waiting for the next timer tick.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error};

use crate::cancel::CancelToken;
use crate::error::{OutboxError, Result};
use crate::models::EventCandidate;
use crate::processor::event_executor::{EventExecutor, ProcessOutcome};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub(crate) struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    executor: Arc<EventExecutor>,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<String>>,
    max_queued_events: usize,
    cancel: CancelToken,
    retry_tx: mpsc::UnboundedSender<DateTime<Utc>>,
}

impl Dispatcher {
    pub(crate) fn new(
        executor: Arc<EventExecutor>,
        max_event_concurrency: usize,
        max_queued_events: usize,
        cancel: CancelToken,
        retry_tx: mpsc::UnboundedSender<DateTime<Utc>>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                executor,
                permits: Arc::new(Semaphore::new(max_event_concurrency)),
                in_flight: Mutex::new(HashSet::new()),
                max_queued_events,
                cancel,
                retry_tx,
            }),
        }
    }

    /// Queued plus running events.
    pub(crate) fn pending_count(&self) -> usize {
        self.inner.in_flight.lock().unwrap().len()
    }

    /// Whether the polling loop may submit another batch.
    pub(crate) fn has_capacity(&self) -> bool {
        self.pending_count() < self.inner.max_queued_events
    }

    /// Schedule one attempt. Returns `false` when the event is already in
    /// flight (or shutdown has begun) and nothing was scheduled.
    pub(crate) fn submit(&self, candidate: EventCandidate) -> bool {
        if self.inner.cancel.is_cancelled() {
            return false;
        }

        let id = candidate.id.clone();
        {
            let mut in_flight = self.inner.in_flight.lock().unwrap();
            if !in_flight.insert(id.clone()) {
                debug!(event_id = %id, "event already in flight, skipping duplicate");
                return false;
            }
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let permit = tokio::select! {
                _ = inner.cancel.cancelled() => None,
                permit = Arc::clone(&inner.permits).acquire_owned() => permit.ok(),
            };

            if let Some(_permit) = permit {
                match inner.executor.process_event(&candidate, &inner.cancel).await {
                    Ok(ProcessOutcome::Processed { retry_at: Some(at) }) => {
                        // Receiver gone means the poller stopped; the event
                        // still surfaces on a later poll.
                        let _ = inner.retry_tx.send(at);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(
                            event_id = %candidate.id,
                            error = %e,
                            "event attempt failed, the event remains eligible for retry"
                        );
                    }
                }
            }

            inner.in_flight.lock().unwrap().remove(&candidate.id);
        });

        true
    }

    /// Await completion of all in-flight events, up to `timeout`.
    pub(crate) async fn drain(&self, timeout: Duration) -> Result<()> {
        let drained = tokio::time::timeout(timeout, async {
            while self.pending_count() > 0 {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;

        match drained {
            Ok(()) => Ok(()),
            Err(_) => Err(OutboxError::ShutdownTimeout {
                timeout,
                in_flight: self.pending_count(),
            }),
        }
    }
}
