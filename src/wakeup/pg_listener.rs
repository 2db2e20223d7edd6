//! Postgres LISTEN/NOTIFY wakeup emitter using `sqlx::postgres::PgListener`.
//!
//! Producers `NOTIFY` the configured channel after committing an event (see
//! [`PgWakeupListener::notify`]); a detached forwarding task bridges the
//! notification stream into the processor's bounded signal channel. A
//! connection error ends the forwarding task; the processor keeps working on
//! its fallback timer until the next subscribe.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{WakeupEmitter, WakeupError, WakeupSignal};

/// Configuration for the LISTEN/NOTIFY bridge.
#[derive(Debug, Clone)]
pub struct PgWakeupListenerConfig {
    /// NOTIFY channel name shared with producers.
    pub channel: String,
    /// Bound on buffered, not-yet-consumed signals. Wakeups coalesce, so a
    /// small buffer is enough; overflow drops signals, which is safe.
    pub buffer_size: usize,
}

impl Default for PgWakeupListenerConfig {
    fn default() -> Self {
        Self {
            channel: "outbox_events_wakeup".to_string(),
            buffer_size: 16,
        }
    }
}

/// [`WakeupEmitter`] backed by Postgres LISTEN/NOTIFY.
pub struct PgWakeupListener {
    pool: PgPool,
    config: PgWakeupListenerConfig,
    forward_task: Mutex<Option<JoinHandle<()>>>,
}

impl PgWakeupListener {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, PgWakeupListenerConfig::default())
    }

    pub fn with_config(pool: PgPool, config: PgWakeupListenerConfig) -> Self {
        Self {
            pool,
            config,
            forward_task: Mutex::new(None),
        }
    }

    /// Producer side: signal the channel. Call after committing an event.
    pub async fn notify(pool: &PgPool, channel: &str) -> Result<(), WakeupError> {
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(channel)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WakeupEmitter for PgWakeupListener {
    async fn subscribe(&self) -> Result<mpsc::Receiver<WakeupSignal>, WakeupError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.config.channel).await?;

        info!(channel = %self.config.channel, "wakeup listener subscribed");

        let (tx, rx) = mpsc::channel(self.config.buffer_size);
        let channel = self.config.channel.clone();
        let handle = tokio::spawn(async move {
            let mut stream = listener.into_stream();
            while let Some(notification) = stream.next().await {
                match notification {
                    Ok(_) => {
                        debug!(channel = %channel, "wakeup notification received");
                        // try_send: a full buffer means a poll is already
                        // pending, so the signal is redundant.
                        match tx.try_send(WakeupSignal) {
                            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                debug!("wakeup receiver dropped, stopping forwarder");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "wakeup listener connection error");
                        break;
                    }
                }
            }
            debug!("wakeup forwarding task ended");
        });

        let mut guard = self.forward_task.lock().unwrap();
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn close(&self) -> Result<(), WakeupError> {
        if let Some(handle) = self.forward_task.lock().unwrap().take() {
            handle.abort();
            info!(channel = %self.config.channel, "wakeup listener closed");
        }
        Ok(())
    }
}
