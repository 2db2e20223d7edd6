//! # Wakeup Emitter Contract
//!
//! Optional push channel telling the processor "new work may be ready".
//! Signals are advisory: they trigger a throttled poll but are never
//! authoritative, and losing them must not cause starvation — the fallback
//! timer in the polling loop closes that gap.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod pg_listener;

pub use pg_listener::{PgWakeupListener, PgWakeupListenerConfig};

/// One advisory "work may be ready" signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeupSignal;

/// Failures raised by wakeup emitters.
#[derive(Debug, Error)]
pub enum WakeupError {
    #[error("wakeup channel unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for WakeupError {
    fn from(err: sqlx::Error) -> Self {
        WakeupError::Unavailable(err.to_string())
    }
}

/// Push channel for wakeup signals.
///
/// `subscribe` is called on processor start and hands back a bounded
/// receiver; `close` is called on entry to `stopping`, after which late
/// signals are ignored. Emitters must tolerate subscribe/close cycles so a
/// stopped processor can start again.
#[async_trait]
pub trait WakeupEmitter: Send + Sync {
    async fn subscribe(&self) -> Result<mpsc::Receiver<WakeupSignal>, WakeupError>;

    async fn close(&self) -> Result<(), WakeupError>;
}
