//! # Polling Loop
//!
//! Producer side of the dispatcher: discovers candidate events and submits
//! them. Two modes share one poll entry point:
//!
//! - **Timer-only** (no wakeup emitter): sleep `polling_interval`, poll,
//!   repeat until cancelled.
//! - **Hybrid** (wakeup emitter present): wakeup signals drive a throttled
//!   poll with leading *and* trailing edges — the leading edge gives low
//!   latency on burst onset, the trailing edge guarantees one more poll
//!   after the burst so an event arriving inside the throttle window is not
//!   missed. A fallback timer fires every `polling_interval` but polls only
//!   after `wakeup_timeout` of signal silence, so a dead push channel can
//!   only add latency, never starve the processor.
//!
//! Both paths funnel through the same throttle, so they cannot race into
//! concurrent polls; an `is_polling` guard additionally rejects reentry.
//! Backoff-expiry self-wakeups reported by the dispatcher are scheduled
//! here as one-shot timers feeding the same throttled entry point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::cancel::CancelToken;
use crate::processor::dispatcher::Dispatcher;
use crate::storage::EventStore;
use crate::wakeup::WakeupSignal;

pub(crate) struct Poller {
    store: Arc<dyn EventStore>,
    dispatcher: Dispatcher,
    cancel: CancelToken,
    max_errors: i32,
    polling_interval: Duration,
    wakeup_timeout: Duration,
    throttle_window: Duration,
    is_polling: AtomicBool,
    throttle: Mutex<ThrottleState>,
    last_wakeup: Mutex<Instant>,
}

#[derive(Default)]
struct ThrottleState {
    window_started: Option<Instant>,
    trailing_scheduled: bool,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn EventStore>,
        dispatcher: Dispatcher,
        cancel: CancelToken,
        max_errors: i32,
        polling_interval: Duration,
        wakeup_timeout: Duration,
        throttle_window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            dispatcher,
            cancel,
            max_errors,
            polling_interval,
            wakeup_timeout,
            throttle_window,
            is_polling: AtomicBool::new(false),
            throttle: Mutex::new(ThrottleState::default()),
            last_wakeup: Mutex::new(Instant::now()),
        })
    }

    /// One poll tick: read candidates, filter against in-flight work,
    /// submit. Reentry is rejected rather than queued.
    pub(crate) async fn poll_once(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.is_polling.swap(true, Ordering::AcqRel) {
            debug!("poll already in progress, rejecting reentry");
            return;
        }
        self.do_poll().await;
        self.is_polling.store(false, Ordering::Release);
    }

    async fn do_poll(&self) {
        if !self.dispatcher.has_capacity() {
            debug!(
                pending = self.dispatcher.pending_count(),
                "dispatcher at capacity, skipping poll tick"
            );
            return;
        }

        match self
            .store
            .events_to_process(self.max_errors, &self.cancel)
            .await
        {
            Ok(candidates) => {
                let found = candidates.len();
                let mut submitted = 0;
                for candidate in candidates {
                    if self.dispatcher.submit(candidate) {
                        submitted += 1;
                    }
                }
                if found > 0 {
                    debug!(found, submitted, "poll tick complete");
                }
            }
            Err(e) => {
                // Supervisor behavior: log and let the next tick retry.
                error!(error = %e, "polling read failed, resuming next tick");
            }
        }
    }

    /// Throttled poll entry point with leading and trailing edges.
    pub(crate) fn trigger(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }

        let now = Instant::now();
        let mut state = self.throttle.lock().unwrap();
        match state.window_started {
            Some(started) if now.duration_since(started) < self.throttle_window => {
                if !state.trailing_scheduled {
                    state.trailing_scheduled = true;
                    let delay = self.throttle_window - now.duration_since(started);
                    let poller = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = poller.cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        {
                            let mut state = poller.throttle.lock().unwrap();
                            state.trailing_scheduled = false;
                            state.window_started = Some(Instant::now());
                        }
                        poller.poll_once().await;
                    });
                }
            }
            _ => {
                state.window_started = Some(now);
                drop(state);
                let poller = Arc::clone(self);
                tokio::spawn(async move {
                    poller.poll_once().await;
                });
            }
        }
    }

    /// Timer-only mode: sleep, poll, repeat.
    pub(crate) async fn run_timer_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.polling_interval) => self.poll_once().await,
            }
        }
        debug!("timer polling loop stopped");
    }

    /// Hybrid mode: consume wakeup signals into the throttled poll.
    pub(crate) async fn run_wakeup_loop(self: Arc<Self>, mut signals: mpsc::Receiver<WakeupSignal>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(_) => {
                        *self.last_wakeup.lock().unwrap() = Instant::now();
                        self.trigger();
                    }
                    None => {
                        debug!("wakeup channel closed, fallback timer keeps polling");
                        break;
                    }
                }
            }
        }
        debug!("wakeup polling loop stopped");
    }

    /// Hybrid mode: starvation guard. Polls on the timer cadence only while
    /// the push channel has been silent for `wakeup_timeout`.
    pub(crate) async fn run_fallback_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.polling_interval) => {
                    let silent_for = self.last_wakeup.lock().unwrap().elapsed();
                    if silent_for >= self.wakeup_timeout {
                        debug!(silent_for_ms = silent_for.as_millis() as u64, "wakeup channel silent, fallback poll");
                        self.trigger();
                    }
                }
            }
        }
        debug!("fallback polling loop stopped");
    }

    /// Schedule one-shot self-wakeups at backoff expiry instants reported
    /// by the dispatcher, shortening retry latency below the poll period.
    pub(crate) async fn run_retry_loop(
        self: Arc<Self>,
        mut retries: mpsc::UnboundedReceiver<DateTime<Utc>>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                instant = retries.recv() => match instant {
                    Some(at) => {
                        let poller = Arc::clone(&self);
                        tokio::spawn(async move {
                            let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                            tokio::select! {
                                _ = poller.cancel.cancelled() => {}
                                _ = tokio::time::sleep(delay) => poller.trigger(),
                            }
                        });
                    }
                    None => break,
                }
            }
        }
        debug!("retry wakeup loop stopped");
    }
}
