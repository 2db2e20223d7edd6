//! End-to-end processor runs against the in-memory store.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{processed, seed_event, wait_for, TestWakeupEmitter};
use outbox_core::backoff::ExponentialBackoff;
use outbox_core::handler::{handler_fn, HandlerError};
use outbox_core::processor::Processor;
use outbox_core::registry::HandlerRegistry;
use outbox_core::storage::MemoryEventStore;
use outbox_core::ProcessorConfig;

fn fast_poll_config() -> ProcessorConfig {
    ProcessorConfig {
        polling_interval: Duration::from_millis(25),
        ..ProcessorConfig::default()
    }
}

fn tiny_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(80),
        multiplier: 2.0,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn timer_polling_drains_seeded_events() {
    let store = MemoryEventStore::new();
    let handled = Arc::new(AtomicU32::new(0));
    let counter = handled.clone();

    let registry = HandlerRegistry::new().register(
        "order_placed",
        "record",
        handler_fn(move |_event, _cancel| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );

    let processor = Processor::builder(store.clone())
        .registry(registry)
        .config(fast_poll_config())
        .build()
        .unwrap();

    for i in 0..3 {
        seed_event(&store, &format!("e{i}"), "order_placed");
    }

    processor.start().await.unwrap();
    wait_for("all events processed", Duration::from_secs(5), || {
        (0..3).all(|i| processed(&store, &format!("e{i}")))
    })
    .await;
    processor.stop(None).await.unwrap();

    assert_eq!(handled.load(Ordering::SeqCst), 3);
    for i in 0..3 {
        let event = store.get(&format!("e{i}")).unwrap();
        assert_eq!(event.errors, 0);
        assert!(event.handler_results["record"].processed_at.is_some());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn self_wakeup_retries_well_before_the_next_poll_tick() {
    let store = MemoryEventStore::new();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let registry = HandlerRegistry::new().register(
        "order_placed",
        "flaky",
        handler_fn(move |_event, _cancel| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(HandlerError::transient("first attempt fails"))
                } else {
                    Ok(())
                }
            }
        }),
    );

    // The poll timer alone would need 60 s for the retry; the self-wakeup at
    // backoff expiry has to carry it.
    let emitter = TestWakeupEmitter::new();
    let processor = Processor::builder(store.clone())
        .registry(registry)
        .config(ProcessorConfig {
            polling_interval: Duration::from_secs(60),
            wakeup_throttle: Duration::from_millis(10),
            ..ProcessorConfig::default()
        })
        .backoff(tiny_backoff())
        .wakeup_emitter(emitter.clone())
        .build()
        .unwrap();

    seed_event(&store, "e1", "order_placed");
    processor.start().await.unwrap();
    emitter.signal().await;

    wait_for("retry to complete", Duration::from_secs(3), || {
        processed(&store, "e1")
    })
    .await;
    processor.stop(None).await.unwrap();

    let event = store.get("e1").unwrap();
    assert_eq!(event.errors, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(event.handler_results["flaky"].errors.len(), 1);
    assert!(event.handler_results["flaky"].processed_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn every_handler_reaches_success_despite_induced_failures() {
    let store = MemoryEventStore::new();
    let attempts: Arc<Mutex<HashMap<String, u32>>> = Arc::default();
    let by_event = attempts.clone();

    // Each event fails twice before succeeding.
    let registry = HandlerRegistry::new().register(
        "order_placed",
        "eventually",
        handler_fn(move |event, _cancel| {
            let by_event = by_event.clone();
            async move {
                let mut attempts = by_event.lock().unwrap();
                let count = attempts.entry(event.id.clone()).or_insert(0);
                *count += 1;
                if *count <= 2 {
                    Err(HandlerError::transient("not yet"))
                } else {
                    Ok(())
                }
            }
        }),
    );

    let processor = Processor::builder(store.clone())
        .registry(registry)
        .config(fast_poll_config())
        .backoff(tiny_backoff())
        .build()
        .unwrap();

    for i in 0..5 {
        seed_event(&store, &format!("e{i}"), "order_placed");
    }

    processor.start().await.unwrap();
    wait_for("all events to succeed", Duration::from_secs(10), || {
        (0..5).all(|i| processed(&store, &format!("e{i}")))
    })
    .await;
    processor.stop(None).await.unwrap();

    for i in 0..5 {
        let event = store.get(&format!("e{i}")).unwrap();
        assert_eq!(event.errors, 2, "two failed attempts recorded");
        assert!(event.backoff_until.is_none());
        let result = &event.handler_results["eventually"];
        assert!(result.processed_at.is_some());
        assert_eq!(result.errors.len(), 2, "history preserved through success");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_letter_events_flow_through_their_own_handler_group() {
    use async_trait::async_trait;
    use outbox_core::cancel::CancelToken;
    use outbox_core::hook::{HookError, MaxErrorsHook};
    use outbox_core::models::{Event, NewEvent};
    use outbox_core::storage::EventTransaction;

    struct DeadLetterHook;

    #[async_trait]
    impl MaxErrorsHook for DeadLetterHook {
        async fn on_max_errors(
            &self,
            event: Event,
            tx: &mut dyn EventTransaction,
            _cancel: &CancelToken,
        ) -> Result<(), HookError> {
            tx.insert_event(NewEvent {
                id: format!("{}-dead", event.id),
                timestamp: chrono::Utc::now(),
                event_type: "delivery_failed".to_string(),
                data: event.data.clone(),
                correlation_id: event.correlation_id.clone(),
            })
            .await?;
            Ok(())
        }
    }

    let store = MemoryEventStore::new();
    let notified = Arc::new(AtomicU32::new(0));
    let counter = notified.clone();

    let registry = HandlerRegistry::new()
        .register(
            "order_placed",
            "poison",
            handler_fn(|_event, _cancel| async {
                Err(HandlerError::unprocessable("cannot ever succeed"))
            }),
        )
        .register(
            "delivery_failed",
            "alert",
            handler_fn(move |_event, _cancel| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

    let processor = Processor::builder(store.clone())
        .registry(registry)
        .config(fast_poll_config())
        .max_errors_hook(DeadLetterHook)
        .build()
        .unwrap();

    seed_event(&store, "e1", "order_placed");
    processor.start().await.unwrap();

    wait_for("dead letter to be handled", Duration::from_secs(5), || {
        processed(&store, "e1-dead")
    })
    .await;
    processor.stop(None).await.unwrap();

    let original = store.get("e1").unwrap();
    assert_eq!(original.errors, 5, "sweep drove the event to the ceiling");
    assert!(original.processed_at.is_some());
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn backpressure_gate_blocks_polling_entirely_at_zero_capacity() {
    let store = MemoryEventStore::new();
    let registry = HandlerRegistry::new().declare_type("order_placed");

    let processor = Processor::builder(store.clone())
        .registry(registry)
        .config(ProcessorConfig {
            polling_interval: Duration::from_millis(20),
            max_queued_events: 0,
            ..ProcessorConfig::default()
        })
        .build()
        .unwrap();

    seed_event(&store, "e1", "order_placed");
    processor.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    processor.stop(None).await.unwrap();

    assert!(
        !processed(&store, "e1"),
        "a zero-capacity dispatcher must skip every poll tick"
    );
}
