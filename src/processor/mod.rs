//! # Processor
//!
//! Lifecycle controller wrapping the polling loop, the dispatcher, and the
//! per-event executor behind a `start` / `stop` pair.
//!
//! States move `stopped → started → stopping → stopped`; a transition from
//! any other source state is rejected with a warning, never an error. Stop
//! signals the shared cancel token, closes the wakeup subscription, joins
//! the polling tasks, and then awaits the dispatcher drain up to a bounded
//! window; a drain timeout is reported to the caller after the state has
//! already settled at `stopped`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::cancel::CancelToken;
use crate::config::ProcessorConfig;
use crate::error::{OutboxError, Result};
use crate::hook::MaxErrorsHook;
use crate::registry::HandlerRegistry;
use crate::storage::EventStore;
use crate::wakeup::WakeupEmitter;

pub(crate) mod dispatcher;
pub(crate) mod event_executor;
pub(crate) mod poller;

use dispatcher::Dispatcher;
use event_executor::EventExecutor;
use poller::Poller;

/// Lifecycle state of a [`Processor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Stopped,
    Started,
    Stopping,
}

impl std::fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessorState::Stopped => write!(f, "stopped"),
            ProcessorState::Started => write!(f, "started"),
            ProcessorState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Transactional outbox event processor.
///
/// ```no_run
/// use outbox_core::handler::handler_fn;
/// use outbox_core::processor::Processor;
/// use outbox_core::registry::HandlerRegistry;
/// use outbox_core::storage::MemoryEventStore;
///
/// # async fn example() -> outbox_core::error::Result<()> {
/// let registry = HandlerRegistry::new().register(
///     "order_placed",
///     "send_confirmation",
///     handler_fn(|event, _cancel| async move {
///         println!("confirming order {}", event.id);
///         Ok(())
///     }),
/// );
///
/// let processor = Processor::builder(MemoryEventStore::new())
///     .registry(registry)
///     .build()?;
/// processor.start().await?;
/// // ... events inserted by producers are drained here ...
/// processor.stop(None).await?;
/// # Ok(())
/// # }
/// ```
pub struct Processor {
    store: Arc<dyn EventStore>,
    registry: Arc<HandlerRegistry>,
    config: ProcessorConfig,
    backoff: Arc<dyn BackoffPolicy>,
    wakeup_emitter: Option<Arc<dyn WakeupEmitter>>,
    max_errors_hook: Option<Arc<dyn MaxErrorsHook>>,
    state: Mutex<ProcessorState>,
    runtime: Mutex<Option<Runtime>>,
}

struct Runtime {
    cancel: CancelToken,
    dispatcher: Dispatcher,
    tasks: Vec<JoinHandle<()>>,
}

/// Builder for [`Processor`].
pub struct ProcessorBuilder {
    store: Arc<dyn EventStore>,
    registry: HandlerRegistry,
    config: ProcessorConfig,
    backoff: Arc<dyn BackoffPolicy>,
    wakeup_emitter: Option<Arc<dyn WakeupEmitter>>,
    max_errors_hook: Option<Arc<dyn MaxErrorsHook>>,
}

impl Processor {
    pub fn builder(store: impl EventStore + 'static) -> ProcessorBuilder {
        ProcessorBuilder {
            store: Arc::new(store),
            registry: HandlerRegistry::new(),
            config: ProcessorConfig::default(),
            backoff: Arc::new(ExponentialBackoff::default()),
            wakeup_emitter: None,
            max_errors_hook: None,
        }
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.lock().unwrap()
    }

    /// Start polling and dispatching. Idempotent with a warning: calling
    /// `start` on anything but a stopped processor is a no-op.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ProcessorState::Stopped {
                warn!(state = %state, "processor start ignored, not stopped");
                return Ok(());
            }
            *state = ProcessorState::Started;
        }

        let cancel = CancelToken::new();
        let executor = Arc::new(EventExecutor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.backoff),
            self.max_errors_hook.clone(),
            self.config.max_errors_i32(),
            self.config.max_handler_concurrency,
        ));
        let (retry_tx, retry_rx) = tokio::sync::mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            executor,
            self.config.max_event_concurrency,
            self.config.max_queued_events,
            cancel.clone(),
            retry_tx,
        );
        let poller = Poller::new(
            Arc::clone(&self.store),
            dispatcher.clone(),
            cancel.clone(),
            self.config.max_errors_i32(),
            self.config.polling_interval,
            self.config.wakeup_timeout,
            self.config.wakeup_throttle,
        );

        let mut tasks = Vec::new();
        match &self.wakeup_emitter {
            Some(emitter) => {
                let signals = match emitter.subscribe().await {
                    Ok(signals) => signals,
                    Err(e) => {
                        *self.state.lock().unwrap() = ProcessorState::Stopped;
                        return Err(e.into());
                    }
                };
                tasks.push(tokio::spawn(Arc::clone(&poller).run_wakeup_loop(signals)));
                tasks.push(tokio::spawn(Arc::clone(&poller).run_fallback_loop()));
            }
            None => {
                tasks.push(tokio::spawn(Arc::clone(&poller).run_timer_loop()));
            }
        }
        tasks.push(tokio::spawn(Arc::clone(&poller).run_retry_loop(retry_rx)));

        *self.runtime.lock().unwrap() = Some(Runtime {
            cancel,
            dispatcher,
            tasks,
        });

        info!(
            polling_interval_ms = self.config.polling_interval.as_millis() as u64,
            max_event_concurrency = self.config.max_event_concurrency,
            wakeup = self.wakeup_emitter.is_some(),
            "processor started"
        );
        Ok(())
    }

    /// Stop with a bounded-time graceful drain. `timeout` defaults to the
    /// configured `shutdown_timeout`.
    ///
    /// Cancellation is signalled first, then the wakeup subscription is
    /// detached (late signals are ignored), then in-flight events are
    /// awaited. On timeout the processor still ends up `stopped` and the
    /// caller gets [`OutboxError::ShutdownTimeout`].
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ProcessorState::Started {
                warn!(state = %state, "processor stop ignored, not started");
                return Ok(());
            }
            *state = ProcessorState::Stopping;
        }

        let timeout = timeout.unwrap_or(self.config.shutdown_timeout);
        let runtime = self.runtime.lock().unwrap().take();
        let Some(runtime) = runtime else {
            *self.state.lock().unwrap() = ProcessorState::Stopped;
            return Ok(());
        };

        runtime.cancel.cancel();

        if let Some(emitter) = &self.wakeup_emitter {
            if let Err(e) = emitter.close().await {
                warn!(error = %e, "wakeup emitter close failed");
            }
        }

        for task in runtime.tasks {
            let _ = task.await;
        }

        let drained = runtime.dispatcher.drain(timeout).await;
        *self.state.lock().unwrap() = ProcessorState::Stopped;

        match drained {
            Ok(()) => {
                info!("processor stopped");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "processor stopped without draining");
                Err(e)
            }
        }
    }
}

impl ProcessorBuilder {
    /// Handler groups keyed by event type.
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default capped-exponential backoff policy.
    pub fn backoff(mut self, backoff: impl BackoffPolicy + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Optional push channel for low-latency polling.
    pub fn wakeup_emitter(mut self, emitter: impl WakeupEmitter + 'static) -> Self {
        self.wakeup_emitter = Some(Arc::new(emitter));
        self
    }

    /// Optional terminal-failure hook, run inside the terminal update's
    /// transaction.
    pub fn max_errors_hook(mut self, hook: impl MaxErrorsHook + 'static) -> Self {
        self.max_errors_hook = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<Processor> {
        self.config
            .validate()
            .map_err(OutboxError::Configuration)?;

        Ok(Processor {
            store: self.store,
            registry: Arc::new(self.registry),
            config: self.config,
            backoff: self.backoff,
            wakeup_emitter: self.wakeup_emitter,
            max_errors_hook: self.max_errors_hook,
            state: Mutex::new(ProcessorState::Stopped),
            runtime: Mutex::new(None),
        })
    }
}
