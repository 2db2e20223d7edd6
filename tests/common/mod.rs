//! Shared fixtures for the integration suite.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use outbox_core::cancel::CancelToken;
use outbox_core::error::StorageResult;
use outbox_core::models::{Event, EventCandidate, NewEvent};
use outbox_core::storage::{EventStore, EventTransaction, MemoryEventStore};
use outbox_core::wakeup::{WakeupEmitter, WakeupError, WakeupSignal};

pub fn seed_event(store: &MemoryEventStore, id: &str, event_type: &str) {
    store
        .insert(
            NewEvent {
                id: id.to_string(),
                timestamp: Utc::now(),
                event_type: event_type.to_string(),
                data: serde_json::json!({"seq": id}),
                correlation_id: Some(format!("corr-{id}")),
            }
            .into_event(),
        )
        .unwrap();
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, condition: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn processed(store: &MemoryEventStore, id: &str) -> bool {
    store.get(id).map_or(false, |e| e.processed_at.is_some())
}

/// In-process wakeup emitter: tests push signals by hand.
#[derive(Clone, Default)]
pub struct TestWakeupEmitter {
    sender: Arc<Mutex<Option<mpsc::Sender<WakeupSignal>>>>,
}

impl TestWakeupEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn signal(&self) {
        let sender = self.sender.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.send(WakeupSignal).await;
        }
    }
}

#[async_trait]
impl WakeupEmitter for TestWakeupEmitter {
    async fn subscribe(&self) -> Result<mpsc::Receiver<WakeupSignal>, WakeupError> {
        let (tx, rx) = mpsc::channel(16);
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn close(&self) -> Result<(), WakeupError> {
        self.sender.lock().unwrap().take();
        Ok(())
    }
}

/// Delegating store that counts polling reads, for throttle assertions.
#[derive(Clone)]
pub struct CountingStore {
    inner: MemoryEventStore,
    pub polls: Arc<AtomicU32>,
}

impl CountingStore {
    pub fn new(inner: MemoryEventStore) -> Self {
        Self {
            inner,
            polls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn poll_count(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for CountingStore {
    async fn events_to_process(
        &self,
        max_errors: i32,
        cancel: &CancelToken,
    ) -> StorageResult<Vec<EventCandidate>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.inner.events_to_process(max_errors, cancel).await
    }

    async fn begin(&self) -> StorageResult<Box<dyn EventTransaction>> {
        self.inner.begin().await
    }
}

/// Per-event concurrency gauge proving the skip-locked single-owner rule.
#[derive(Clone, Default)]
pub struct ConcurrencyGauge {
    current: Arc<Mutex<std::collections::HashMap<String, u32>>>,
    violations: Arc<AtomicU32>,
    invocations: Arc<AtomicU32>,
}

impl ConcurrencyGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, event: &Event) {
        let mut current = self.current.lock().unwrap();
        let count = current.entry(event.id.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.invocations.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exit(&self, event: &Event) {
        let mut current = self.current.lock().unwrap();
        if let Some(count) = current.get_mut(&event.id) {
            *count -= 1;
        }
    }

    pub fn violations(&self) -> u32 {
        self.violations.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}
