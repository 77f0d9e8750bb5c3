//! The application: configuration, a dispatcher and the loop that feeds it.
//!
//! Updates reach the dispatcher in one of two ways:
//!
//! - **Push**: anything holding an [`UpdateIntake`] (a webhook server, a test)
//!   submits updates; [`Application::run`] drains them in arrival order.
//! - **Pull**: [`Application::run_polling`] asks an [`UpdateSource`] for
//!   batches and confirms each update only after the dispatcher is done
//!   with it.
//!
//! ```rust,ignore
//! use courier_runtime::Application;
//!
//! let app = Application::builder().bot(bot).build()?;
//! app.dispatcher().add_handler(on_command(["start"]).callback(start), 0)?;
//! app.run_bot_polling().await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::signal;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::{BoxedBot, Update};
use courier_framework::{ConversationStore, DispatchStats, Dispatcher};

use crate::config::{ConfigLoader, ConfigResult, CourierConfig};
use crate::error::{IntakeError, RuntimeError, RuntimeResult};
use crate::logging;
use crate::source::{BotPollingSource, UpdateSource};

// =============================================================================
// UpdateIntake
// =============================================================================

/// A cloneable handle for pushing updates into a running application.
#[derive(Debug, Clone)]
pub struct UpdateIntake {
    tx: mpsc::Sender<Update>,
}

impl UpdateIntake {
    /// Queues an update without waiting.
    pub fn try_submit(&self, update: Update) -> Result<(), IntakeError> {
        self.tx.try_send(update).map_err(|e| match e {
            mpsc::error::TrySendError::Full(u) => IntakeError::Full(Box::new(u)),
            mpsc::error::TrySendError::Closed(u) => IntakeError::Closed(Box::new(u)),
        })
    }

    /// Queues an update, waiting for space if the queue is full.
    pub async fn submit(&self, update: Update) -> Result<(), IntakeError> {
        self.tx
            .send(update)
            .await
            .map_err(|e| IntakeError::Closed(Box::new(e.0)))
    }

    /// Queues an update from synchronous code, blocking the thread while the
    /// queue is full.
    ///
    /// Must not be called from inside the async runtime.
    pub fn blocking_submit(&self, update: Update) -> Result<(), IntakeError> {
        self.tx
            .blocking_send(update)
            .map_err(|e| IntakeError::Closed(Box::new(e.0)))
    }

    /// Free slots in the queue.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Counters since the application was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Updates taken from the intake queue or a source.
    pub received: u64,
    /// Successful fetches from an [`UpdateSource`].
    pub polls: u64,
    /// Failed fetches from an [`UpdateSource`].
    pub poll_errors: u64,
    pub dispatch: DispatchStats,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    polls: AtomicU64,
    poll_errors: AtomicU64,
}

// =============================================================================
// Application
// =============================================================================

/// Owns the dispatcher and drives it from an update stream.
///
/// An application runs once: after any `run*` method returns, the dispatcher
/// is shut down and later runs fail with [`RuntimeError::AlreadyRunning`].
pub struct Application {
    config: CourierConfig,
    dispatcher: Dispatcher,
    intake: UpdateIntake,
    receiver: Mutex<Option<mpsc::Receiver<Update>>>,
    shutdown: CancellationToken,
    counters: Counters,
}

impl Application {
    /// Loads configuration from the current directory, falling back to
    /// defaults, and initializes logging.
    pub fn new() -> Self {
        let config = ConfigLoader::new()
            .with_current_dir()
            .load()
            .unwrap_or_else(|e| {
                eprintln!("Warning: Failed to load config ({e}), using defaults");
                CourierConfig::default()
            });
        Self::from_config(&config)
    }

    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    /// Creates an application without a bot and initializes logging.
    pub fn from_config(config: &CourierConfig) -> Self {
        logging::init_from_config(&config.logging);
        Self::assemble(config.clone(), None, None)
    }

    fn assemble(
        config: CourierConfig,
        bot: Option<BoxedBot>,
        persistence: Option<Arc<dyn ConversationStore>>,
    ) -> Self {
        let mut dispatcher = Dispatcher::builder()
            .config(config.dispatcher.clone())
            .conversation_defaults(config.conversation.clone());
        if let Some(bot) = bot {
            dispatcher = dispatcher.bot(bot);
        }
        if let Some(store) = persistence {
            dispatcher = dispatcher.persistence(store);
        }

        let (tx, rx) = mpsc::channel(config.intake.capacity.max(1));
        info!(
            workers = config.dispatcher.workers,
            intake_capacity = config.intake.capacity,
            log_level = %config.logging.level,
            "Application initialized"
        );

        Self {
            dispatcher: dispatcher.build(),
            intake: UpdateIntake { tx },
            receiver: Mutex::new(Some(rx)),
            shutdown: CancellationToken::new(),
            counters: Counters::default(),
            config,
        }
    }

    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    /// The dispatcher handlers are registered on.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn bot(&self) -> Option<&BoxedBot> {
        self.dispatcher.bot()
    }

    /// A handle for pushing updates into [`run`](Self::run).
    pub fn intake(&self) -> UpdateIntake {
        self.intake.clone()
    }

    /// Asks a running loop to stop after the update in progress.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// The token [`stop`](Self::stop) cancels.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            received: self.counters.received.load(Ordering::Relaxed),
            polls: self.counters.polls.load(Ordering::Relaxed),
            poll_errors: self.counters.poll_errors.load(Ordering::Relaxed),
            dispatch: self.dispatcher.stats(),
        }
    }

    // ─── Push ────────────────────────────────────────────────────────────────

    /// Processes intake updates until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> RuntimeResult<()> {
        info!("Courier is running. Press Ctrl+C to stop.");
        self.run_until(wait_for_signal()).await
    }

    /// Processes intake updates until `shutdown` resolves or [`stop`](Self::stop)
    /// is called.
    ///
    /// Updates already queued when the loop stops are still processed; later
    /// submissions fail with [`IntakeError::Closed`].
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        let mut rx = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or(RuntimeError::AlreadyRunning)?;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = &mut shutdown => break,
                next = rx.recv() => match next {
                    Some(update) => self.dispatch(update).await,
                    None => break,
                },
            }
        }

        rx.close();
        while let Some(update) = rx.recv().await {
            self.dispatch(update).await;
        }
        self.finish().await;
        Ok(())
    }

    // ─── Pull ────────────────────────────────────────────────────────────────

    /// Polls the configured bot with `getUpdates` until Ctrl+C or SIGTERM.
    pub async fn run_bot_polling(&self) -> RuntimeResult<()> {
        let bot = self.bot().cloned().ok_or(RuntimeError::NoBot)?;
        let source = BotPollingSource::new(bot, self.config.polling.clone());
        self.run_polling(&source).await
    }

    /// Polls `source` until Ctrl+C or SIGTERM.
    pub async fn run_polling<S>(&self, source: &S) -> RuntimeResult<()>
    where
        S: UpdateSource + ?Sized,
    {
        info!("Courier is polling. Press Ctrl+C to stop.");
        self.run_polling_until(source, wait_for_signal()).await
    }

    /// Polls `source` until `shutdown` resolves or [`stop`](Self::stop) is called.
    ///
    /// The offset passed to the next fetch is one past the last update whose
    /// blocking handlers have completed. A failed fetch is retried after
    /// `polling.retry_delay_ms`.
    pub async fn run_polling_until<S, F>(&self, source: &S, shutdown: F) -> RuntimeResult<()>
    where
        S: UpdateSource + ?Sized,
        F: Future<Output = ()>,
    {
        // Claim the run slot so push and pull never drive the same dispatcher.
        let _rx = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or(RuntimeError::AlreadyRunning)?;
        tokio::pin!(shutdown);

        let retry_delay = self.config.polling.retry_delay();
        let mut offset: Option<i64> = None;

        'poll: loop {
            let batch = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = &mut shutdown => break,
                batch = source.fetch(offset) => batch,
            };

            match batch {
                Ok(updates) => {
                    self.counters.polls.fetch_add(1, Ordering::Relaxed);
                    for update in updates {
                        let next = update.update_id + 1;
                        self.dispatch(update).await;
                        offset = Some(offset.map_or(next, |o| o.max(next)));
                        if self.shutdown.is_cancelled() {
                            break 'poll;
                        }
                    }
                }
                Err(e) => {
                    self.counters.poll_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, delay_ms = retry_delay.as_millis() as u64, "Fetching updates failed, retrying");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                }
            }
        }

        if let Some(offset) = offset
            && let Err(e) = source.acknowledge(offset).await
        {
            warn!(offset, error = %e, "Failed to acknowledge processed updates");
        }
        self.finish().await;
        Ok(())
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    async fn dispatch(&self, update: Update) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let report = self.dispatcher.process_update(update).await;
        debug!(
            update_id = report.update_id,
            status = ?report.status,
            handlers = report.handled.len(),
            pending = report.pending.len(),
            "Update dispatched"
        );
    }

    async fn finish(&self) {
        info!("Stopping Courier");
        self.shutdown.cancel();
        self.dispatcher.shutdown().await;
        let stats = self.stats();
        if stats.dispatch.failed > 0 {
            error!(?stats, "Courier stopped with failed updates");
        } else {
            info!(?stats, "Courier stopped");
        }
    }
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("dispatcher", &self.dispatcher)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
///
/// If no signal handler can be installed this never resolves; use
/// [`Application::stop`] instead.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// ApplicationBuilder
// =============================================================================

/// Builder for an [`Application`].
///
/// ```rust,ignore
/// let app = Application::builder()
///     .config_file("config/courier.toml")
///     .profile("production")
///     .bot(bot)
///     .persistence(Arc::new(JsonFileStore::open("state.json").await?))
///     .build()?;
/// ```
pub struct ApplicationBuilder {
    config_loader: ConfigLoader,
    config: Option<CourierConfig>,
    bot: Option<BoxedBot>,
    persistence: Option<Arc<dyn ConversationStore>>,
    init_logging: bool,
}

impl ApplicationBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
            config: None,
            bot: None,
            persistence: None,
            init_logging: true,
        }
    }

    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Uses `config` as is, skipping files and environment variables.
    pub fn config(mut self, config: CourierConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn bot(mut self, bot: BoxedBot) -> Self {
        self.bot = Some(bot);
        self
    }

    /// The store persistent conversations use.
    pub fn persistence(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.persistence = Some(store);
        self
    }

    /// Leaves the global tracing subscriber alone.
    pub fn without_logging(mut self) -> Self {
        self.init_logging = false;
        self
    }

    pub fn build(self) -> ConfigResult<Application> {
        let config = match self.config {
            Some(config) => {
                crate::config::validate_config(&config)?;
                config
            }
            None => self.config_loader.load()?,
        };
        if self.init_logging {
            logging::init_from_config(&config.logging);
        }
        Ok(Application::assemble(config, self.bot, self.persistence))
    }
}

impl Default for ApplicationBuilder {
    fn default() -> Self {
        Self::new()
    }
}
