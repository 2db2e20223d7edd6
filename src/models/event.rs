//! # Event Model
//!
//! The only persistent entity the core touches. Events are created
//! externally inside a producer transaction; the core reads them, mutates
//! the processing-state fields (`handler_results`, `errors`, `backoff_until`,
//! `processed_at`) and writes them back. It never deletes.
//!
//! ## Storage Mapping
//!
//! The reference Postgres adapter maps this struct to the `outbox_events`
//! table, with `handler_results` stored as JSONB:
//!
//! ```sql
//! CREATE TABLE outbox_events (
//!   id VARCHAR PRIMARY KEY,
//!   "timestamp" TIMESTAMPTZ NOT NULL,
//!   event_type VARCHAR NOT NULL,
//!   data JSONB NOT NULL,
//!   correlation_id VARCHAR,
//!   handler_results JSONB NOT NULL,
//!   errors INTEGER NOT NULL,
//!   backoff_until TIMESTAMPTZ,
//!   processed_at TIMESTAMPTZ
//! );
//! ```
//!
//! ## Invariants at every commit boundary
//!
//! 1. `processed_at` set ⇒ the event is terminal; no handler runs again.
//! 2. `errors <= max_errors`; equality ⇒ `processed_at` set, `backoff_until` null.
//! 3. Per handler result, at most one of `processed_at` / `unprocessable_at`
//!    is set; both unset means retry-eligible.
//! 4. A handler result's error history is never reset, not even by a later
//!    successful attempt.
//! 5. `backoff_until`, when written, is strictly in the future.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted outbox event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Primary key, selected by the producer. Opaque to the core.
    pub id: String,
    /// Creation instant; drives FIFO-ish poll ordering.
    pub timestamp: DateTime<Utc>,
    /// Selects the handler group.
    pub event_type: String,
    /// Opaque payload, passed to handlers verbatim.
    pub data: serde_json::Value,
    /// Carried through logs; never interpreted.
    pub correlation_id: Option<String>,
    /// Per-handler outcome bookkeeping. Growable, never pruned.
    pub handler_results: HashMap<String, HandlerResult>,
    /// Global attempt count for the event.
    pub errors: i32,
    /// While set and in the future, the event is hidden from polling.
    pub backoff_until: Option<DateTime<Utc>>,
    /// Terminal marker: success or exhausted retries.
    pub processed_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Terminal events are no longer eligible for polling or dispatch.
    pub fn is_terminal(&self) -> bool {
        self.processed_at.is_some()
    }

    /// The polling predicate shared by every adapter: unprocessed, not in
    /// backoff, and below the retry ceiling.
    pub fn is_poll_eligible(&self, max_errors: i32, now: DateTime<Utc>) -> bool {
        self.processed_at.is_none()
            && self.backoff_until.map_or(true, |until| until < now)
            && self.errors < max_errors
    }

    /// The `(id, errors)` shape the polling read produces.
    pub fn candidate(&self) -> EventCandidate {
        EventCandidate {
            id: self.id.clone(),
            errors: self.errors,
        }
    }
}

/// Per-handler processing state, keyed by handler name on the event.
///
/// Transitions are monotone: `{}` → has `errors` entries and/or
/// `unprocessable_at` → `processed_at` (terminal) or `unprocessable_at`
/// (terminal). A handler that succeeded once is never invoked again for the
/// same event, even across process restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerResult {
    /// The handler succeeded at this instant; it will never rerun.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    /// The handler was poisoned at this instant; it will never rerun.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unprocessable_at: Option<DateTime<Utc>>,
    /// Full retry history. Preserved intact across a later success, so
    /// callers introspecting results must tolerate historical errors on
    /// succeeded handlers.
    #[serde(default)]
    pub errors: Vec<HandlerAttempt>,
}

impl HandlerResult {
    /// Terminal handler results are skipped on every subsequent attempt.
    pub fn is_terminal(&self) -> bool {
        self.processed_at.is_some() || self.unprocessable_at.is_some()
    }
}

/// One recorded handler failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerAttempt {
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Row shape returned by the polling read side.
///
/// `errors` is a snapshot taken outside any lock; the per-event transaction
/// re-checks it under `FOR UPDATE SKIP LOCKED` before dispatching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCandidate {
    pub id: String,
    pub errors: i32,
}

/// Insert shape for new events, used by the max-errors hook to persist a
/// follow-up event inside the terminal update's transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub data: serde_json::Value,
    pub correlation_id: Option<String>,
}

impl NewEvent {
    /// Expand into a full event with pristine processing state.
    pub fn into_event(self) -> Event {
        Event {
            id: self.id,
            timestamp: self.timestamp,
            event_type: self.event_type,
            data: self.data,
            correlation_id: self.correlation_id,
            handler_results: HashMap::new(),
            errors: 0,
            backoff_until: None,
            processed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(id: &str) -> Event {
        NewEvent {
            id: id.to_string(),
            timestamp: Utc::now(),
            event_type: "order_placed".to_string(),
            data: serde_json::json!({"order_id": 42}),
            correlation_id: Some("corr-1".to_string()),
        }
        .into_event()
    }

    #[test]
    fn new_event_starts_poll_eligible() {
        let e = event("e1");
        assert!(!e.is_terminal());
        assert!(e.is_poll_eligible(5, Utc::now()));
        assert_eq!(e.errors, 0);
        assert!(e.handler_results.is_empty());
    }

    #[test]
    fn backoff_in_the_future_hides_from_polling() {
        let now = Utc::now();
        let mut e = event("e1");
        e.backoff_until = Some(now + Duration::seconds(30));
        assert!(!e.is_poll_eligible(5, now));

        // An elapsed backoff makes the event visible again.
        e.backoff_until = Some(now - Duration::seconds(1));
        assert!(e.is_poll_eligible(5, now));
    }

    #[test]
    fn exhausted_or_terminal_events_are_ineligible() {
        let now = Utc::now();
        let mut e = event("e1");
        e.errors = 5;
        assert!(!e.is_poll_eligible(5, now));

        let mut e = event("e2");
        e.processed_at = Some(now);
        assert!(!e.is_poll_eligible(5, now));
    }

    #[test]
    fn handler_result_terminality() {
        let mut result = HandlerResult::default();
        assert!(!result.is_terminal());

        result.errors.push(HandlerAttempt {
            message: "boom".to_string(),
            occurred_at: Utc::now(),
        });
        assert!(!result.is_terminal(), "errors alone are retry-eligible");

        result.processed_at = Some(Utc::now());
        assert!(result.is_terminal());
    }

    #[test]
    fn handler_results_round_trip_through_json() {
        let mut e = event("e1");
        e.handler_results.insert(
            "send_email".to_string(),
            HandlerResult {
                processed_at: Some(Utc::now()),
                unprocessable_at: None,
                errors: vec![HandlerAttempt {
                    message: "smtp timeout".to_string(),
                    occurred_at: Utc::now(),
                }],
            },
        );

        let json = serde_json::to_value(&e.handler_results).unwrap();
        let decoded: HashMap<String, HandlerResult> = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, e.handler_results);
    }

    #[test]
    fn missing_result_fields_default_when_decoding() {
        let decoded: HandlerResult = serde_json::from_str("{}").unwrap();
        assert_eq!(decoded, HandlerResult::default());
    }
}
