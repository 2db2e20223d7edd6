//! # In-Memory Event Store
//!
//! A process-local adapter implementing the full storage contract, including
//! skip-locked semantics. It backs the crate's test suite and suits embedded
//! deployments where events do not need to outlive the process.
//!
//! Locking model: a held lock is an entry in a shared lock set. A second
//! transaction asking for a locked id gets `None` back instead of blocking,
//! mirroring `FOR UPDATE SKIP LOCKED`. Commit and rollback (and transaction
//! drop, as a last resort) release the lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use crate::cancel::CancelToken;
use crate::error::{StorageError, StorageResult};
use crate::models::{Event, EventCandidate, NewEvent};
use crate::storage::{EventStore, EventTransaction};

const DEFAULT_BATCH_SIZE: usize = 100;

/// Shared in-memory event collection with skip-locked transactions.
#[derive(Clone)]
pub struct MemoryEventStore {
    inner: Arc<Inner>,
    batch_size: usize,
}

struct Inner {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    events: HashMap<String, Event>,
    locked: HashSet<String>,
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
            }),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Cap on rows returned by one polling read.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Producer path: insert a new event, as an application transaction
    /// would on a durable store.
    pub fn insert(&self, event: Event) -> StorageResult<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.events.contains_key(&event.id) {
            return Err(StorageError::DuplicateEvent(event.id));
        }
        state.events.insert(event.id.clone(), event);
        Ok(())
    }

    /// Snapshot of a stored event.
    pub fn get(&self, id: &str) -> Option<Event> {
        self.inner.state.lock().unwrap().events.get(id).cloned()
    }

    /// Maintenance path: replace a stored event unconditionally, bypassing
    /// locking. Useful for seeding fixtures and expiring backoff windows.
    pub fn upsert(&self, event: Event) {
        self.inner
            .state
            .lock()
            .unwrap()
            .events
            .insert(event.id.clone(), event);
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn events_to_process(
        &self,
        max_errors: i32,
        cancel: &CancelToken,
    ) -> StorageResult<Vec<EventCandidate>> {
        if cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let state = self.inner.state.lock().unwrap();
        let mut eligible: Vec<&Event> = state
            .events
            .values()
            .filter(|e| e.is_poll_eligible(max_errors, now))
            .collect();
        // Locked events are not filtered out here: the read side is allowed
        // to return rows another worker holds, and lock_event rejects them.
        eligible.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        Ok(eligible
            .into_iter()
            .take(self.batch_size)
            .map(|e| e.candidate())
            .collect())
    }

    async fn begin(&self) -> StorageResult<Box<dyn EventTransaction>> {
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            locked_id: None,
            pending: Vec::new(),
            finished: false,
        }))
    }
}

enum PendingWrite {
    Update(Event),
    Insert(Event),
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    locked_id: Option<String>,
    pending: Vec<PendingWrite>,
    finished: bool,
}

impl MemoryTransaction {
    fn release_lock(state: &mut State, locked_id: &mut Option<String>) {
        if let Some(id) = locked_id.take() {
            state.locked.remove(&id);
        }
    }
}

#[async_trait]
impl EventTransaction for MemoryTransaction {
    async fn lock_event(
        &mut self,
        id: &str,
        max_errors: i32,
        cancel: &CancelToken,
    ) -> StorageResult<Option<Event>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if self.locked_id.is_some() {
            return Err(StorageError::QueryFailed(
                "transaction already holds a row lock".to_string(),
            ));
        }

        let mut state = self.inner.state.lock().unwrap();
        if state.locked.contains(id) {
            // Another worker holds this row; skip, don't block.
            return Ok(None);
        }
        let Some(event) = state.events.get(id) else {
            return Ok(None);
        };
        if !event.is_poll_eligible(max_errors, Utc::now()) {
            return Ok(None);
        }

        let event = event.clone();
        state.locked.insert(id.to_string());
        self.locked_id = Some(id.to_string());
        Ok(Some(event))
    }

    async fn update_event(&mut self, event: &Event) -> StorageResult<()> {
        if self.locked_id.as_deref() != Some(event.id.as_str()) {
            return Err(StorageError::QueryFailed(format!(
                "update of event {} without holding its lock",
                event.id
            )));
        }
        self.pending.push(PendingWrite::Update(event.clone()));
        Ok(())
    }

    async fn insert_event(&mut self, event: NewEvent) -> StorageResult<()> {
        let duplicate_pending = self.pending.iter().any(|w| match w {
            PendingWrite::Insert(e) => e.id == event.id,
            PendingWrite::Update(_) => false,
        });
        if duplicate_pending || self.inner.state.lock().unwrap().events.contains_key(&event.id) {
            return Err(StorageError::DuplicateEvent(event.id));
        }
        self.pending.push(PendingWrite::Insert(event.into_event()));
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StorageResult<()> {
        let mut state = self.inner.state.lock().unwrap();
        let result = (|| {
            for write in self.pending.drain(..) {
                match write {
                    PendingWrite::Update(event) => {
                        if let Some(stored) = state.events.get_mut(&event.id) {
                            stored.handler_results = event.handler_results;
                            stored.errors = event.errors;
                            stored.backoff_until = event.backoff_until;
                            stored.processed_at = event.processed_at;
                        }
                    }
                    PendingWrite::Insert(event) => {
                        if state.events.contains_key(&event.id) {
                            return Err(StorageError::DuplicateEvent(event.id));
                        }
                        state.events.insert(event.id.clone(), event);
                    }
                }
            }
            Ok(())
        })();
        Self::release_lock(&mut state, &mut self.locked_id);
        self.finished = true;
        result
    }

    async fn rollback(mut self: Box<Self>) -> StorageResult<()> {
        let mut state = self.inner.state.lock().unwrap();
        self.pending.clear();
        Self::release_lock(&mut state, &mut self.locked_id);
        self.finished = true;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        // A dropped-but-unfinished transaction must not leave its row locked
        // forever, exactly as a dropped database connection releases locks.
        if !self.finished && self.locked_id.is_some() {
            if let Ok(mut state) = self.inner.state.lock() {
                Self::release_lock(&mut state, &mut self.locked_id);
            }
        }
    }
}
