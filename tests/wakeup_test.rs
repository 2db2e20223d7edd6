//! Hybrid polling: push wakeups, throttle coalescing, and the fallback
//! starvation guard.

mod common;

use std::time::Duration;

use common::{processed, seed_event, wait_for, CountingStore, TestWakeupEmitter};
use outbox_core::processor::Processor;
use outbox_core::registry::HandlerRegistry;
use outbox_core::storage::MemoryEventStore;
use outbox_core::ProcessorConfig;

#[tokio::test(flavor = "multi_thread")]
async fn a_wakeup_signal_short_circuits_the_poll_timer() {
    let store = MemoryEventStore::new();
    let emitter = TestWakeupEmitter::new();

    let processor = Processor::builder(store.clone())
        .registry(HandlerRegistry::new().declare_type("order_placed"))
        .config(ProcessorConfig {
            polling_interval: Duration::from_secs(60),
            wakeup_throttle: Duration::from_millis(10),
            ..ProcessorConfig::default()
        })
        .wakeup_emitter(emitter.clone())
        .build()
        .unwrap();

    processor.start().await.unwrap();
    seed_event(&store, "e1", "order_placed");
    emitter.signal().await;

    wait_for("signal-driven poll", Duration::from_secs(2), || {
        processed(&store, "e1")
    })
    .await;
    processor.stop(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn a_signal_burst_coalesces_into_leading_and_trailing_polls() {
    let store = CountingStore::new(MemoryEventStore::new());
    let emitter = TestWakeupEmitter::new();

    let processor = Processor::builder(store.clone())
        .registry(HandlerRegistry::new().declare_type("order_placed"))
        .config(ProcessorConfig {
            polling_interval: Duration::from_secs(60),
            wakeup_throttle: Duration::from_millis(200),
            ..ProcessorConfig::default()
        })
        .wakeup_emitter(emitter.clone())
        .build()
        .unwrap();

    processor.start().await.unwrap();
    for _ in 0..6 {
        emitter.signal().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    processor.stop(None).await.unwrap();

    let polls = store.poll_count();
    assert!(
        (1..=2).contains(&polls),
        "six signals inside one window should coalesce into at most a \
         leading and a trailing poll, saw {polls}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn the_fallback_timer_polls_when_the_push_channel_is_silent() {
    let store = MemoryEventStore::new();
    let emitter = TestWakeupEmitter::new();

    let processor = Processor::builder(store.clone())
        .registry(HandlerRegistry::new().declare_type("order_placed"))
        .config(ProcessorConfig {
            polling_interval: Duration::from_millis(50),
            wakeup_timeout: Duration::ZERO,
            wakeup_throttle: Duration::from_millis(10),
            ..ProcessorConfig::default()
        })
        .wakeup_emitter(emitter)
        .build()
        .unwrap();

    seed_event(&store, "e1", "order_placed");
    processor.start().await.unwrap();

    // No signal is ever sent; only the fallback timer can find the event.
    wait_for("fallback poll", Duration::from_secs(3), || {
        processed(&store, "e1")
    })
    .await;
    processor.stop(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn signals_after_stop_are_ignored() {
    let store = MemoryEventStore::new();
    let emitter = TestWakeupEmitter::new();

    let processor = Processor::builder(store.clone())
        .registry(HandlerRegistry::new().declare_type("order_placed"))
        .config(ProcessorConfig {
            polling_interval: Duration::from_secs(60),
            wakeup_throttle: Duration::from_millis(10),
            ..ProcessorConfig::default()
        })
        .wakeup_emitter(emitter.clone())
        .build()
        .unwrap();

    processor.start().await.unwrap();
    processor.stop(None).await.unwrap();

    seed_event(&store, "e1", "order_placed");
    emitter.signal().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(
        !processed(&store, "e1"),
        "a stopped processor must not react to late signals"
    );
}
