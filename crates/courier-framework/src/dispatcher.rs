//! The update dispatcher.
//!
//! Handlers live in integer-numbered groups. For every update the
//! dispatcher visits the groups in ascending order and, within a group, the
//! handlers in registration order. The first handler of a group whose check
//! matches gets the update; the rest of that group is skipped, but the update
//! still moves on to the next group.
//!
//! Blocking handlers are awaited in place, including any error handling, so
//! the update's pass is only complete once they are done. Non-blocking
//! handlers are submitted to the [`WorkerPool`]; their [`JobHandle`]s come
//! back in the [`DispatchReport`].
//!
//! ```rust,ignore
//! let dispatcher = Dispatcher::builder()
//!     .config(DispatcherConfig { workers: 8, ..Default::default() })
//!     .bot(bot)
//!     .build();
//!
//! dispatcher.add_handler(on_command(["start"]).callback(start), 0)?;
//! dispatcher.add_handler(on_update(filter::all()).block(false).callback(audit), 1)?;
//! dispatcher.add_error_handler(report_error);
//!
//! let report = dispatcher.process_update(update).await;
//! ```

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, info, info_span, trace, warn};

use courier_core::{BoxedBot, Update};

use crate::chain::ErrorChain;
use crate::context::{CallbackContext, DataStores, DispatchEnv};
use crate::conversation::{ConversationBuilder, ConversationConfig, ConversationStore};
use crate::error::{HandlerFailure, RegistrationResult};
use crate::filter::MatchResult;
use crate::handler::{
    BoxedCallback, BoxedUpdateHandler, Callback, Registration, UpdateHandler, into_callback,
    invoke,
};
use crate::worker::{JobHandle, WorkerPool};

/// Name used for the unhandled-update callback in error reports.
const UNHANDLED: &str = "unhandled";

// =============================================================================
// Configuration
// =============================================================================

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Non-blocking handlers running at once.
    pub workers: usize,
    /// Non-blocking handlers waiting for a worker before submission blocks.
    pub queue_capacity: usize,
    /// Whether handlers without an explicit `block` flag are awaited.
    pub default_block: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            default_block: true,
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Where an update is in its dispatch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Received,
    Matching,
    /// Blocking handlers are done; non-blocking ones are still pending.
    Dispatched,
    Completed,
    /// At least one handler failed. The failure went to the error chain.
    Failed,
}

/// The outcome of one [`Dispatcher::process_update`] call.
#[derive(Debug)]
#[must_use = "pending non-blocking handlers are only observed through the report"]
pub struct DispatchReport {
    pub update_id: i64,
    pub status: UpdateStatus,
    /// `(group, handler name)` of every handler that received the update.
    pub handled: Vec<(i32, String)>,
    /// Non-blocking handlers still running. Each resolves to whether the
    /// handler succeeded.
    pub pending: Vec<JobHandle<bool>>,
}

impl DispatchReport {
    fn new(update_id: i64) -> Self {
        Self {
            update_id,
            status: UpdateStatus::Received,
            handled: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Whether any handler received the update.
    pub fn is_handled(&self) -> bool {
        !self.handled.is_empty()
    }

    /// Waits for the non-blocking handlers and returns the final status.
    pub async fn wait(self) -> UpdateStatus {
        let mut status = match self.status {
            UpdateStatus::Dispatched => UpdateStatus::Completed,
            other => other,
        };
        for job in self.pending {
            if !matches!(job.wait().await, Ok(true)) {
                status = UpdateStatus::Failed;
            }
        }
        status
    }
}

/// Counters since the dispatcher was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub processed: u64,
    pub unhandled: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    unhandled: AtomicU64,
    failed: AtomicU64,
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Routes updates to handler groups.
///
/// Cloning is cheap; clones share the same handlers and pool. Handlers may be
/// added and removed while updates are being processed.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    groups: RwLock<BTreeMap<i32, Vec<BoxedUpdateHandler>>>,
    unhandled: RwLock<Option<BoxedCallback>>,
    errors: Arc<ErrorChain>,
    env: DispatchEnv,
    pool: WorkerPool,
    config: DispatcherConfig,
    conversation_defaults: ConversationConfig,
    persistence: Option<Arc<dyn ConversationStore>>,
    counters: Counters,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Creates a dispatcher with default settings and no bot.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    // ─── Registration ────────────────────────────────────────────────────────

    /// Adds a handler to the end of `group`.
    ///
    /// Fails if the handler rejects this dispatcher, e.g. a persistent
    /// conversation with no store configured.
    pub fn add_handler(&self, handler: impl UpdateHandler, group: i32) -> RegistrationResult<()> {
        self.add_boxed(Arc::new(handler), group)
    }

    /// Adds several handlers to `group`, in order. Stops at the first failure.
    pub fn add_handlers<I, H>(&self, handlers: I, group: i32) -> RegistrationResult<()>
    where
        I: IntoIterator<Item = H>,
        H: UpdateHandler,
    {
        handlers
            .into_iter()
            .try_for_each(|handler| self.add_handler(handler, group))
    }

    /// Adds an already shared handler to `group`.
    pub fn add_boxed(&self, handler: BoxedUpdateHandler, group: i32) -> RegistrationResult<()> {
        handler.on_register(&Registration {
            group,
            persistence: self.inner.persistence.as_ref(),
            bot: self.inner.env.bot(),
        })?;
        debug!(handler = handler.name(), group, "Handler registered");
        self.inner
            .groups
            .write()
            .entry(group)
            .or_default()
            .push(handler);
        Ok(())
    }

    /// Removes the first handler named `name` from `group`.
    pub fn remove_handler(&self, name: &str, group: i32) -> bool {
        let removed = {
            let mut groups = self.inner.groups.write();
            let Some(handlers) = groups.get_mut(&group) else {
                return false;
            };
            let Some(index) = handlers.iter().position(|h| h.name() == name) else {
                return false;
            };
            let removed = handlers.remove(index);
            if handlers.is_empty() {
                groups.remove(&group);
            }
            removed
        };
        removed.on_shutdown();
        debug!(handler = name, group, "Handler removed");
        true
    }

    /// Appends an error handler. Error handlers run in registration order.
    pub fn add_error_handler<F, T>(&self, callback: F)
    where
        F: Callback<T>,
        T: 'static,
    {
        self.inner.errors.push(into_callback(callback));
    }

    /// Sets the callback run for updates no handler matched.
    pub fn set_unhandled_handler<F, T>(&self, callback: F)
    where
        F: Callback<T>,
        T: 'static,
    {
        *self.inner.unhandled.write() = Some(into_callback(callback));
    }

    /// Starts a conversation with this dispatcher's conversation defaults.
    pub fn conversation(&self, name: impl Into<String>) -> ConversationBuilder {
        ConversationBuilder::from_config(name, &self.inner.conversation_defaults)
    }

    // ─── Introspection ───────────────────────────────────────────────────────

    /// Registered group numbers, ascending.
    pub fn groups(&self) -> Vec<i32> {
        self.inner.groups.read().keys().copied().collect()
    }

    /// Total number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.groups.read().values().map(Vec::len).sum()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn bot(&self) -> Option<&BoxedBot> {
        self.inner.env.bot()
    }

    /// The `bot_data` / `chat_data` / `user_data` stores.
    pub fn data(&self) -> &Arc<DataStores> {
        self.inner.env.data()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.inner.counters;
        DispatchStats {
            processed: c.processed.load(Ordering::Relaxed),
            unhandled: c.unhandled.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    // ─── Dispatch ────────────────────────────────────────────────────────────

    /// Runs one update through every handler group.
    ///
    /// Returns once every blocking handler has finished. Callback failures
    /// never escape; they are handed to the error handlers.
    pub async fn process_update(&self, update: Update) -> DispatchReport {
        let update = Arc::new(update);
        let span = info_span!(
            "process_update",
            update_id = update.update_id,
            kind = %update.update_type()
        );
        self.dispatch(update).instrument(span).await
    }

    async fn dispatch(&self, update: Arc<Update>) -> DispatchReport {
        let mut report = DispatchReport::new(update.update_id);
        trace!(status = ?report.status, "Update received");

        let snapshot: Vec<(i32, Vec<BoxedUpdateHandler>)> = self
            .inner
            .groups
            .read()
            .iter()
            .map(|(group, handlers)| (*group, handlers.clone()))
            .collect();

        report.status = UpdateStatus::Matching;
        let mut failed = false;

        for (group, handlers) in snapshot {
            let Some((handler, matched)) = select(&handlers, &update, group).await else {
                continue;
            };
            let name = handler.name().to_string();
            let block = handler.block().unwrap_or(self.inner.config.default_block);
            debug!(group, handler = %name, block, "Handler matched");
            report.handled.push((group, name.clone()));

            let ctx = Arc::new(CallbackContext::new(
                Arc::clone(&update),
                self.inner.env.clone(),
            ));
            if block {
                failed |= !run_handler(handler, ctx, matched).await;
            } else {
                match self
                    .inner
                    .pool
                    .submit(name.clone(), run_handler(handler, ctx, matched))
                    .await
                {
                    Ok(job) => report.pending.push(job),
                    Err(e) => {
                        warn!(group, handler = %name, error = %e, "Non-blocking handler dropped");
                        failed = true;
                    }
                }
            }
        }

        if report.handled.is_empty() {
            self.inner.counters.unhandled.fetch_add(1, Ordering::Relaxed);
            failed |= !self.run_unhandled(&update).await;
        }

        report.status = if failed {
            self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            UpdateStatus::Failed
        } else if report.pending.is_empty() {
            UpdateStatus::Completed
        } else {
            UpdateStatus::Dispatched
        };
        self.inner.counters.processed.fetch_add(1, Ordering::Relaxed);
        debug!(
            status = ?report.status,
            handled = report.handled.len(),
            pending = report.pending.len(),
            "Update dispatched"
        );
        report
    }

    async fn run_unhandled(&self, update: &Arc<Update>) -> bool {
        let Some(callback) = self.inner.unhandled.read().clone() else {
            trace!("No handler matched");
            return true;
        };
        let ctx = CallbackContext::new(Arc::clone(update), self.inner.env.clone());
        match invoke(&callback, Arc::new(ctx)).await {
            Ok(_) => true,
            Err(e) => {
                let failure = HandlerFailure::new(UNHANDLED, Arc::clone(update), e);
                self.inner.env.report(failure).await;
                false
            }
        }
    }

    /// Stops background work and waits for non-blocking handlers to finish.
    pub async fn shutdown(&self) {
        let handlers: Vec<BoxedUpdateHandler> =
            self.inner.groups.read().values().flatten().cloned().collect();
        for handler in &handlers {
            handler.on_shutdown();
        }
        self.inner.pool.shutdown().await;
        info!(stats = ?self.stats(), "Dispatcher shut down");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("groups", &self.groups())
            .field("handlers", &self.handler_count())
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

/// The first handler of a group that wants the update.
async fn select(
    handlers: &[BoxedUpdateHandler],
    update: &Update,
    group: i32,
) -> Option<(BoxedUpdateHandler, MatchResult)> {
    for handler in handlers {
        match handler.check(update).await {
            Ok(MatchResult::NoMatch) => {}
            Ok(matched) => return Some((Arc::clone(handler), matched)),
            Err(e) => warn!(
                group,
                handler = handler.name(),
                error = %e,
                "Filter failed, treating as no match"
            ),
        }
    }
    None
}

/// Runs a handler and routes its failure to the error chain.
async fn run_handler(
    handler: BoxedUpdateHandler,
    ctx: Arc<CallbackContext>,
    matched: MatchResult,
) -> bool {
    let update = Arc::clone(ctx.update());
    let env = ctx.env().clone();
    match handler.handle(ctx, matched).await {
        Ok(_) => true,
        Err(e) => {
            env.report(HandlerFailure::new(handler.name(), update, e))
                .await;
            false
        }
    }
}

impl tower::Service<Update> for Dispatcher {
    type Response = DispatchReport;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<DispatchReport, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, update: Update) -> Self::Future {
        let dispatcher = self.clone();
        Box::pin(async move { Ok(dispatcher.process_update(update).await) })
    }
}

// =============================================================================
// DispatcherBuilder
// =============================================================================

/// Builder for [`Dispatcher`].
#[derive(Default)]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    conversation_defaults: ConversationConfig,
    bot: Option<BoxedBot>,
    persistence: Option<Arc<dyn ConversationStore>>,
}

impl DispatcherBuilder {
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults for conversations created with [`Dispatcher::conversation`].
    pub fn conversation_defaults(mut self, config: ConversationConfig) -> Self {
        self.conversation_defaults = config;
        self
    }

    /// The bot handed to callbacks.
    pub fn bot(mut self, bot: BoxedBot) -> Self {
        self.bot = Some(bot);
        self
    }

    /// The store persistent conversations use.
    pub fn persistence(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.persistence = Some(store);
        self
    }

    pub fn build(self) -> Dispatcher {
        let errors = Arc::new(ErrorChain::default());
        let pool = WorkerPool::new(self.config.workers, self.config.queue_capacity);
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                groups: RwLock::new(BTreeMap::new()),
                unhandled: RwLock::new(None),
                env: DispatchEnv::new(self.bot, Arc::clone(&errors)),
                errors,
                pool,
                config: self.config,
                conversation_defaults: self.conversation_defaults,
                persistence: self.persistence,
                counters: Counters::default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::time::Duration;

    use async_trait::async_trait;
    use courier_core::{ApiResult, Bot, Chat, Message, User};
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use tokio::time::Instant;
    use tower::ServiceExt;

    use super::*;
    use crate::conversation::{EntryCollision, InMemoryStore};
    use crate::error::RegistrationError;
    use crate::extractor::{CommandArgs, Failure};
    use crate::filter::{self, try_filter_fn};
    use crate::routing::{on_command, on_message, on_update};
    use crate::transition::State;

    struct MockBot {
        sent: Mutex<Vec<(String, Value)>>,
    }

    impl MockBot {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Bot for MockBot {
        fn id(&self) -> i64 {
            42
        }

        fn username(&self) -> Option<&str> {
            Some("mock_bot")
        }

        async fn call_api(&self, method: &str, params: Value) -> ApiResult<Value> {
            self.sent.lock().push((method.to_string(), params));
            Ok(json!({ "message_id": 1, "date": 0, "chat": { "id": 1, "type": "private" } }))
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, label: &'static str) -> impl Fn() -> futures::future::Ready<()> + Clone + Send + Sync + 'static {
        let log = log.clone();
        move || {
            log.lock().push(label.to_string());
            futures::future::ready(())
        }
    }

    fn text(id: i64, text: &str) -> Update {
        let msg = Message::new(id, Chat::private(5))
            .with_from(User::new(5, "Ada"))
            .with_text(text);
        Update::message_update(id, msg)
    }

    #[tokio::test]
    async fn test_groups_and_first_match() {
        let dispatcher = Dispatcher::new();
        let log: Log = Arc::default();

        dispatcher
            .add_handler(on_update(filter::is_command("start")).callback(recorder(&log, "A")), 0)
            .unwrap();
        dispatcher
            .add_handler(on_update(filter::all()).callback(recorder(&log, "B")), 0)
            .unwrap();
        dispatcher
            .add_handler(on_update(filter::all()).callback(recorder(&log, "C")), 1)
            .unwrap();

        let report = dispatcher.process_update(text(1, "/start")).await;
        assert_eq!(report.status, UpdateStatus::Completed);
        assert_eq!(report.handled.len(), 2);
        assert_eq!(*log.lock(), vec!["A", "C"]);

        log.lock().clear();
        let _ = dispatcher.process_update(text(2, "hello")).await;
        assert_eq!(*log.lock(), vec!["B", "C"]);
    }

    #[tokio::test]
    async fn test_match_data_and_bot_reach_callback() {
        let bot = MockBot::new();
        let dispatcher = Dispatcher::builder().bot(bot.clone()).build();
        dispatcher
            .add_handler(
                on_command(["echo"]).callback(
                    |msg: Message, bot: BoxedBot, CommandArgs(args): CommandArgs| async move {
                        bot.send_message(msg.chat.id, &args.join(" ")).await.map(|_| ())
                    },
                ),
                0,
            )
            .unwrap();

        let report = dispatcher.process_update(text(1, "/echo hi there")).await;
        assert_eq!(report.status, UpdateStatus::Completed);
        let sent = bot.sent.lock();
        assert_eq!(sent[0].0, "sendMessage");
        assert_eq!(sent[0].1["text"], json!("hi there"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_worker_does_not_block_dispatch() {
        let dispatcher = Dispatcher::builder()
            .config(DispatcherConfig {
                workers: 1,
                ..Default::default()
            })
            .build();
        let spans = Arc::new(Mutex::new(Vec::new()));
        let fast: Log = Arc::default();

        let slow_spans = spans.clone();
        dispatcher
            .add_handler(
                on_message(filter::text_equals("slow"))
                    .block(false)
                    .callback(move || {
                        let spans = slow_spans.clone();
                        async move {
                            let start = Instant::now();
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            spans.lock().push((start, Instant::now()));
                        }
                    }),
                0,
            )
            .unwrap();
        dispatcher
            .add_handler(
                on_message(filter::text_equals("fast")).callback(recorder(&fast, "fast")),
                0,
            )
            .unwrap();

        let first = dispatcher.process_update(text(1, "slow")).await;
        let second = dispatcher.process_update(text(2, "slow")).await;
        assert_eq!(first.status, UpdateStatus::Dispatched);

        let before = Instant::now();
        let third = dispatcher.process_update(text(3, "fast")).await;
        assert_eq!(Instant::now(), before);
        assert_eq!(third.status, UpdateStatus::Completed);
        assert_eq!(*fast.lock(), vec!["fast"]);

        assert_eq!(first.wait().await, UpdateStatus::Completed);
        assert_eq!(second.wait().await, UpdateStatus::Completed);
        let spans = spans.lock();
        assert_eq!(spans.len(), 2);
        assert!(spans[1].0 >= spans[0].1);
    }

    #[tokio::test]
    async fn test_errors_reach_chain_and_dispatch_continues() {
        let dispatcher = Dispatcher::new();
        let failures: Log = Arc::default();
        let log: Log = Arc::default();

        dispatcher
            .add_handler(
                on_message(filter::text_equals("fail")).callback(|| async { Err::<(), _>("bad") }),
                0,
            )
            .unwrap();
        dispatcher
            .add_handler(
                on_message(filter::text_equals("bg"))
                    .name("background")
                    .block(false)
                    .callback(|| async { Err::<(), _>("bad in background") }),
                0,
            )
            .unwrap();
        dispatcher
            .add_handler(on_update(filter::all()).callback(recorder(&log, "later")), 1)
            .unwrap();

        let seen = failures.clone();
        dispatcher.add_error_handler(move |Failure(f): Failure| {
            let seen = seen.clone();
            async move { seen.lock().push(f.update.update_id.to_string()) }
        });
        let seen = failures.clone();
        dispatcher.add_error_handler(move |Failure(f): Failure| {
            let seen = seen.clone();
            async move { seen.lock().push(f.handler.clone()) }
        });

        let report = dispatcher.process_update(text(1, "fail")).await;
        assert_eq!(report.status, UpdateStatus::Failed);
        assert_eq!(failures.lock().len(), 2);
        assert_eq!(failures.lock()[0], "1");
        assert_eq!(*log.lock(), vec!["later"]);

        failures.lock().clear();
        let report = dispatcher.process_update(text(2, "bg")).await;
        assert_eq!(report.wait().await, UpdateStatus::Failed);
        assert_eq!(*failures.lock(), vec!["2", "background"]);
        assert_eq!(dispatcher.stats().processed, 2);
    }

    #[tokio::test]
    async fn test_filter_error_is_no_match() {
        let dispatcher = Dispatcher::new();
        let log: Log = Arc::default();
        dispatcher
            .add_handler(
                on_update(try_filter_fn("broken", |_| Err::<bool, _>("cannot decide")))
                    .callback(recorder(&log, "broken")),
                0,
            )
            .unwrap();
        dispatcher
            .add_handler(on_update(filter::all()).callback(recorder(&log, "next")), 0)
            .unwrap();

        let report = dispatcher.process_update(text(1, "x")).await;
        assert_eq!(report.status, UpdateStatus::Completed);
        assert_eq!(*log.lock(), vec!["next"]);
    }

    #[tokio::test]
    async fn test_unhandled_callback() {
        let dispatcher = Dispatcher::new();
        let log: Log = Arc::default();
        dispatcher
            .add_handler(on_command(["start"]).callback(recorder(&log, "start")), 0)
            .unwrap();
        dispatcher.set_unhandled_handler(recorder(&log, "unhandled"));

        let report = dispatcher.process_update(text(1, "/start")).await;
        assert!(report.is_handled());
        let report = dispatcher.process_update(text(2, "what")).await;
        assert!(!report.is_handled());
        assert_eq!(*log.lock(), vec!["start", "unhandled"]);
        assert_eq!(dispatcher.stats().unhandled, 1);
    }

    #[tokio::test]
    async fn test_remove_handler() {
        let dispatcher = Dispatcher::new();
        let log: Log = Arc::default();
        dispatcher
            .add_handlers(
                [
                    on_update(filter::all()).name("first").callback(recorder(&log, "first")),
                    on_update(filter::all()).name("second").callback(recorder(&log, "second")),
                ],
                3,
            )
            .unwrap();
        assert_eq!(dispatcher.handler_count(), 2);

        assert!(dispatcher.remove_handler("first", 3));
        assert!(!dispatcher.remove_handler("first", 3));
        let _ = dispatcher.process_update(text(1, "x")).await;
        assert_eq!(*log.lock(), vec!["second"]);

        assert!(dispatcher.remove_handler("second", 3));
        assert!(dispatcher.groups().is_empty());
    }

    #[tokio::test]
    async fn test_persistent_conversation_needs_store() {
        let plain = Dispatcher::new();
        let conversation = plain
            .conversation("saved")
            .entry_point(on_command(["start"]).callback(|| async { State::new("A") }))
            .persistent(true)
            .build()
            .unwrap();
        assert!(matches!(
            plain.add_handler(conversation, 0),
            Err(RegistrationError::MissingPersistence(_))
        ));

        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryStore::new());
        let persistent = Dispatcher::builder().persistence(store.clone()).build();
        let conversation = persistent
            .conversation("saved")
            .entry_point(on_command(["start"]).callback(|| async { State::new("A") }))
            .state("A", Vec::<crate::handler::Handler>::new())
            .persistent(true)
            .build()
            .unwrap();
        persistent.add_handler(conversation, 0).unwrap();

        let _ = persistent.process_update(text(1, "/start")).await;
        let key = crate::conversation::ConversationKey::new(Some(5), Some(5));
        let record = store.load("saved", &key).await.unwrap().unwrap();
        assert_eq!(record.state, State::new("A"));
    }

    #[tokio::test]
    async fn test_discard_lets_only_first_entry_start() {
        let dispatcher = Dispatcher::builder()
            .conversation_defaults(ConversationConfig {
                collision: EntryCollision::Discard,
                ..Default::default()
            })
            .build();
        let log: Log = Arc::default();

        let entry_log = log.clone();
        let conversation = dispatcher
            .conversation("quiz")
            .entry_point(on_command(["quiz"]).callback(move || {
                entry_log.lock().push("entry".to_string());
                async { State::new("ASKING") }
            }))
            .state(
                "ASKING",
                [on_message(filter::text()).callback(recorder(&log, "answer"))],
            )
            .block(false)
            .build()
            .unwrap();
        dispatcher.add_handler(conversation, 0).unwrap();

        let first = dispatcher.process_update(text(1, "/quiz")).await;
        let second = dispatcher.process_update(text(2, "/quiz")).await;
        // the first entry holds the key until it has run, so the second is rejected
        assert!(first.is_handled());
        assert!(!second.is_handled());
        first.wait().await;
        second.wait().await;
        assert_eq!(*log.lock(), vec!["entry"]);

        let _ = dispatcher.process_update(text(3, "/quiz")).await.wait().await;
        let _ = dispatcher.process_update(text(4, "42")).await.wait().await;
        assert_eq!(*log.lock(), vec!["entry", "answer"]);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_blocking_conversation_keeps_follow_up() {
        let dispatcher = Dispatcher::new();
        let log: Log = Arc::default();
        let conversation = dispatcher
            .conversation("signup")
            .entry_point(on_command(["start"]).callback(|| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                State::new("NAME")
            }))
            .state(
                "NAME",
                [on_message(filter::text()).callback(recorder(&log, "name"))],
            )
            .collision(EntryCollision::Block)
            .block(false)
            .build()
            .unwrap();
        dispatcher.add_handler(conversation, 0).unwrap();

        let first = dispatcher.process_update(text(1, "/start")).await;
        // the entry callback is still running when the answer arrives
        let second = dispatcher.process_update(text(2, "Ada")).await;
        assert!(first.is_handled());
        assert!(second.is_handled());

        assert_eq!(first.wait().await, UpdateStatus::Completed);
        assert_eq!(second.wait().await, UpdateStatus::Completed);
        assert_eq!(*log.lock(), vec!["name"]);
        assert_eq!(dispatcher.stats().unhandled, 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_tower_service() {
        let dispatcher = Dispatcher::new();
        let log: Log = Arc::default();
        dispatcher
            .add_handler(on_update(filter::all()).callback(recorder(&log, "seen")), 0)
            .unwrap();

        let report = dispatcher.clone().oneshot(text(7, "x")).await.unwrap();
        assert_eq!(report.update_id, 7);
        assert_eq!(*log.lock(), vec!["seen"]);
    }
}
