//! Keyed conversation state machines.
//!
//! A [`ConversationHandler`] is an [`UpdateHandler`] that keeps one state per
//! conversation key (chat, user, or both) and routes each update to the
//! handlers declared for the key's current state:
//!
//! 1. With no active conversation, the entry points are tried. An entry
//!    callback returning a state starts the conversation.
//! 2. With an active conversation, the handlers of the current state are tried
//!    first and the fallbacks second.
//! 3. A callback's return value moves the conversation: `()`/`None` stays,
//!    a [`State`] moves, [`Transition::End`] deletes the stored record.
//!
//! Updates for one key are applied strictly one at a time under a per-key
//! lock. An update accepted by [`check`](UpdateHandler::check) reserves the
//! key until its [`handle`](UpdateHandler::handle) runs, so a follow-up update
//! arriving before a non-blocking predecessor has run queues behind it
//! instead of being judged against the old state.
//!
//! With a timeout configured, every transition re-arms an idle timer; when it
//! fires, the first matching timeout handler runs and the conversation is
//! removed. Records restored from a persistent store get their timers re-armed
//! at registration, and a record found idle past the timeout is expired
//! before the update that found it is routed.
//!
//! ```rust,ignore
//! let signup = ConversationHandler::builder("signup")
//!     .entry_point(on_command(["signup"]).callback(ask_name))
//!     .state("NAME", [on_message(filter::text()).callback(save_name)])
//!     .fallback(on_command(["cancel"]).callback(cancel))
//!     .timeout(Duration::from_secs(300))
//!     .build()?;
//! dispatcher.add_handler(signup, 0)?;
//! ```

mod store;
mod timeout;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use courier_core::{Update, UpdateType};

use crate::context::{CallbackContext, DispatchEnv};
use crate::error::{
    DispatchResult, FilterError, HandlerFailure, RegistrationError, RegistrationResult,
    StoreError, TransitionError,
};
use crate::filter::{FilterResult, MatchResult};
use crate::handler::{BoxedUpdateHandler, Registration, UpdateHandler};
use crate::transition::{State, Transition};

pub use store::{ConversationRecord, ConversationStore, InMemoryStore, JsonFileStore, StoreResult};
pub use timeout::TimeoutExpired;
use timeout::{TimeoutScheduler, TimerHandle};

type KeyLock = Arc<tokio::sync::Mutex<()>>;

// =============================================================================
// Keys and policies
// =============================================================================

/// Identifies one conversation of one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    pub chat_id: Option<i64>,
    pub user_id: Option<i64>,
}

impl ConversationKey {
    pub fn new(chat_id: Option<i64>, user_id: Option<i64>) -> Self {
        Self { chat_id, user_id }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.chat_id, self.user_id) {
            (Some(chat), Some(user)) => write!(f, "chat {chat}/user {user}"),
            (Some(chat), None) => write!(f, "chat {chat}"),
            (None, Some(user)) => write!(f, "user {user}"),
            (None, None) => f.write_str("global"),
        }
    }
}

/// What happens when an entry point matches for a key that is already in a
/// conversation, or whose previous update is still being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryCollision {
    /// Wait for the key, then route to the active conversation's handlers.
    /// Entry points are not consulted while a conversation is active.
    #[default]
    Block,
    /// Wait for the key, then restart the conversation from the entry point.
    Replace,
    /// Reject the update; the conversation reports no match.
    Discard,
}

/// Defaults applied to conversations built through the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Idle timeout in seconds. `None` disables timeouts.
    pub timeout_secs: Option<u64>,
    /// Entry collision policy.
    pub collision: EntryCollision,
    /// Keep state in the dispatcher's persistent store.
    pub persistent: bool,
}

impl ConversationConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Entry,
    Restart,
    State,
    Fallback,
}

struct Route {
    stage: Stage,
    handler: BoxedUpdateHandler,
    matched: MatchResult,
}

/// The key lock, taken by `check` on behalf of the update it accepted.
struct Reservation {
    update_id: i64,
    guard: OwnedMutexGuard<()>,
}

/// The update and environment a timeout handler runs with.
struct Origin {
    env: DispatchEnv,
    update: Arc<Update>,
}

impl Origin {
    fn of(ctx: &CallbackContext) -> Self {
        Self {
            env: ctx.env().clone(),
            update: Arc::clone(ctx.update()),
        }
    }
}

// =============================================================================
// ConversationHandler
// =============================================================================

/// A handler that drives one state machine per conversation key.
#[derive(Clone)]
pub struct ConversationHandler {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    entry_points: Vec<BoxedUpdateHandler>,
    states: HashMap<State, Vec<BoxedUpdateHandler>>,
    fallbacks: Vec<BoxedUpdateHandler>,
    timeout_handlers: Vec<BoxedUpdateHandler>,
    per_chat: bool,
    per_user: bool,
    collision: EntryCollision,
    timeout: Option<Duration>,
    block: Option<bool>,
    persistent: bool,
    registered: AtomicBool,
    store: OnceLock<Arc<dyn ConversationStore>>,
    locks: DashMap<ConversationKey, KeyLock>,
    reserved: DashMap<ConversationKey, Reservation>,
    timers: TimeoutScheduler,
    generation: AtomicU64,
}

impl ConversationHandler {
    /// Starts building a conversation.
    pub fn builder(name: impl Into<String>) -> ConversationBuilder {
        ConversationBuilder::new(name)
    }

    /// The key an update belongs to, if it can take part in this conversation.
    ///
    /// Channel posts never do.
    pub fn key_for(&self, update: &Update) -> Option<ConversationKey> {
        self.inner.key_for(update)
    }

    /// The stored state for `key`.
    pub async fn current_state(&self, key: &ConversationKey) -> StoreResult<Option<State>> {
        let store = self.inner.store()?;
        Ok(store
            .load(&self.inner.name, key)
            .await?
            .map(|record| record.state))
    }

    /// Whether `state` was declared.
    pub fn has_state(&self, state: &State) -> bool {
        self.inner.states.contains_key(state)
    }

    pub fn collision(&self) -> EntryCollision {
        self.inner.collision
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    /// Number of armed idle timers.
    pub fn pending_timeouts(&self) -> usize {
        self.inner.timers.len()
    }
}

#[async_trait]
impl UpdateHandler for ConversationHandler {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn block(&self) -> Option<bool> {
        self.inner.block
    }

    async fn check(&self, update: &Update) -> FilterResult {
        let inner = &self.inner;
        let Some(key) = inner.key_for(update) else {
            return Ok(MatchResult::NoMatch);
        };
        let lock = inner.key_lock(key);
        let result = match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => {
                let result = inner.check_idle(key, update).await;
                if matches!(&result, Ok(matched) if matched.is_match()) {
                    inner.reserved.insert(
                        key,
                        Reservation {
                            update_id: update.update_id,
                            guard,
                        },
                    );
                }
                result
            }
            Err(_) => Ok(inner.check_busy(update).await),
        };
        inner.release_lock(&key, lock);
        result
    }

    async fn handle(
        &self,
        ctx: Arc<CallbackContext>,
        _matched: MatchResult,
    ) -> DispatchResult<Transition> {
        let inner = &self.inner;
        let Some(key) = inner.key_for(ctx.update()) else {
            return Ok(Transition::Stay);
        };
        let update_id = ctx.update().update_id;
        let lock = inner.key_lock(key);
        let reservation = inner
            .reserved
            .remove_if(&key, |_, r| r.update_id == update_id)
            .map(|(_, reservation)| reservation);
        let guard = match reservation {
            Some(reservation) => reservation.guard,
            None => Arc::clone(&lock).lock_owned().await,
        };
        let result = inner.process(key, ctx).await;
        drop(guard);
        inner.release_lock(&key, lock);
        result
    }

    fn on_register(&self, registration: &Registration<'_>) -> RegistrationResult<()> {
        let inner = &self.inner;
        if inner.persistent {
            if inner.store.get().is_none() {
                let store = registration
                    .persistence
                    .ok_or_else(|| RegistrationError::MissingPersistence(inner.name.clone()))?;
                let _ = inner.store.set(Arc::clone(store));
            }
            if inner.registered.swap(true, Ordering::SeqCst) {
                return Err(RegistrationError::AlreadyRegistered(inner.name.clone()));
            }
        }
        if let Some(delay) = inner.timeout
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            runtime.spawn(Arc::clone(inner).restore_timers(delay));
        }
        Ok(())
    }

    fn on_shutdown(&self) {
        self.inner.timers.cancel_all();
        self.inner.reserved.clear();
    }
}

impl fmt::Debug for ConversationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut states: Vec<&str> = self.inner.states.keys().map(State::as_str).collect();
        states.sort_unstable();
        f.debug_struct("ConversationHandler")
            .field("name", &self.inner.name)
            .field("states", &states)
            .field("collision", &self.inner.collision)
            .field("timeout", &self.inner.timeout)
            .field("persistent", &self.inner.persistent)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn key_for(&self, update: &Update) -> Option<ConversationKey> {
        if matches!(
            update.update_type(),
            UpdateType::ChannelPost | UpdateType::EditedChannelPost
        ) {
            return None;
        }
        let chat_id = match self.per_chat {
            true => Some(update.effective_chat()?.id),
            false => None,
        };
        let user_id = match self.per_user {
            true => Some(update.effective_user()?.id),
            false => None,
        };
        Some(ConversationKey::new(chat_id, user_id))
    }

    fn store(&self) -> StoreResult<&Arc<dyn ConversationStore>> {
        self.store.get().ok_or_else(|| {
            StoreError::Backend(format!(
                "conversation '{}' has no store; register it with a dispatcher first",
                self.name
            ))
        })
    }

    // ─── Per-key locks ───────────────────────────────────────────────────────

    fn key_lock(&self, key: ConversationKey) -> KeyLock {
        self.locks.entry(key).or_default().clone()
    }

    fn release_lock(&self, key: &ConversationKey, lock: KeyLock) {
        drop(lock);
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Whether a stored record has been idle longer than the timeout.
    fn is_stale(&self, record: &ConversationRecord) -> bool {
        self.timeout.is_some_and(|timeout| {
            now_ms().saturating_sub(record.updated_at_ms) >= timeout.as_millis() as u64
        })
    }

    fn next_generation(&self, previous: Option<u64>) -> u64 {
        let next = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        previous.map_or(next, |p| next.max(p + 1))
    }

    // ─── Routing ─────────────────────────────────────────────────────────────

    async fn first_match(
        &self,
        handlers: &[BoxedUpdateHandler],
        update: &Update,
    ) -> Option<(BoxedUpdateHandler, MatchResult)> {
        for handler in handlers {
            match handler.check(update).await {
                Ok(MatchResult::NoMatch) => {}
                Ok(matched) => return Some((Arc::clone(handler), matched)),
                Err(e) => warn!(
                    conversation = %self.name,
                    handler = handler.name(),
                    error = %e,
                    "Filter failed, treating as no match"
                ),
            }
        }
        None
    }

    /// Decides against the stored state. Called with the key locked.
    async fn check_idle(&self, key: ConversationKey, update: &Update) -> FilterResult {
        let to_filter_error = |e: StoreError| FilterError::new(self.name.clone(), e.to_string());
        let store = self.store().map_err(to_filter_error)?;
        let record = store
            .load(&self.name, &key)
            .await
            .map_err(to_filter_error)?
            .filter(|record| !self.is_stale(record));

        Ok(self
            .resolve(update, record.as_ref())
            .await
            .map_or(MatchResult::NoMatch, |route| route.matched))
    }

    /// Decides for a key whose previous update is still in flight.
    ///
    /// The stored state is about to change, so the update is accepted when any
    /// handler of the conversation could take it and is routed for real once
    /// it holds the key lock. Under [`EntryCollision::Discard`] an update
    /// matching an entry point is rejected.
    async fn check_busy(&self, update: &Update) -> MatchResult {
        let entry = self.first_match(&self.entry_points, update).await;
        if entry.is_some() && self.collision == EntryCollision::Discard {
            debug!(conversation = %self.name, "Entry discarded, key is busy");
            return MatchResult::NoMatch;
        }
        if let Some((_, matched)) = entry {
            return matched;
        }
        for handlers in self.states.values() {
            if let Some((_, matched)) = self.first_match(handlers, update).await {
                return matched;
            }
        }
        self.first_match(&self.fallbacks, update)
            .await
            .map_or(MatchResult::NoMatch, |(_, matched)| matched)
    }

    async fn resolve(&self, update: &Update, record: Option<&ConversationRecord>) -> Option<Route> {
        let route = |stage, (handler, matched)| Route {
            stage,
            handler,
            matched,
        };

        let Some(record) = record else {
            return self
                .first_match(&self.entry_points, update)
                .await
                .map(|entry| route(Stage::Entry, entry));
        };

        match self.collision {
            EntryCollision::Block => {}
            EntryCollision::Replace => {
                if let Some(entry) = self.first_match(&self.entry_points, update).await {
                    return Some(route(Stage::Restart, entry));
                }
            }
            EntryCollision::Discard => {
                if self
                    .first_match(&self.entry_points, update)
                    .await
                    .is_some()
                {
                    debug!(
                        conversation = %self.name,
                        state = %record.state,
                        "Entry discarded, conversation is active"
                    );
                    return None;
                }
            }
        }

        let handlers = self
            .states
            .get(&record.state)
            .map(Vec::as_slice)
            .unwrap_or_default();
        if let Some(found) = self.first_match(handlers, update).await {
            return Some(route(Stage::State, found));
        }
        self.first_match(&self.fallbacks, update)
            .await
            .map(|found| route(Stage::Fallback, found))
    }

    // ─── Applying transitions ────────────────────────────────────────────────

    /// Runs one update through the state machine. Called with the key locked.
    async fn process(
        self: &Arc<Self>,
        key: ConversationKey,
        ctx: Arc<CallbackContext>,
    ) -> DispatchResult<Transition> {
        let store = self.store()?;
        let mut record = store.load(&self.name, &key).await?;
        if record.as_ref().is_some_and(|r| self.is_stale(r)) {
            debug!(conversation = %self.name, %key, "Stored conversation idle past its timeout");
            self.time_out(key, Some(&Origin::of(&ctx))).await;
            self.timers.cancel(&key);
            record = None;
        }
        let Some(route) = self.resolve(ctx.update(), record.as_ref()).await else {
            debug!(
                conversation = %self.name,
                %key,
                state = record.as_ref().map(|r| r.state.as_str()),
                "Queued update matches no handler in the current state, consumed without effect"
            );
            return Ok(Transition::Stay);
        };

        debug!(
            conversation = %self.name,
            %key,
            stage = ?route.stage,
            handler = route.handler.name(),
            state = record.as_ref().map(|r| r.state.as_str()),
            "Routing update"
        );
        let transition = route
            .handler
            .handle(Arc::clone(&ctx), route.matched)
            .await?;
        self.apply(key, record, route.stage, transition.clone(), &ctx)
            .await?;
        Ok(transition)
    }

    async fn apply(
        self: &Arc<Self>,
        key: ConversationKey,
        current: Option<ConversationRecord>,
        stage: Stage,
        transition: Transition,
        ctx: &CallbackContext,
    ) -> DispatchResult<()> {
        let store = self.store()?;
        let seen = current.as_ref().map(|r| r.generation);

        match transition {
            Transition::Stay => {
                let Some(mut record) = current else {
                    return Ok(());
                };
                if !self.stamp_matches(store, &key, seen).await? {
                    return Ok(());
                }
                record.updated_at_ms = now_ms();
                store.save(&self.name, &key, &record).await?;
                self.arm_timer(key, record.generation, ctx);
            }
            Transition::To(state) => {
                if !self.states.contains_key(&state) {
                    if let Err(e) = store.remove(&self.name, &key).await {
                        error!(conversation = %self.name, %key, error = %e, "Failed to remove conversation");
                    }
                    self.timers.cancel(&key);
                    warn!(conversation = %self.name, %key, %state, "Undeclared state, conversation terminated");
                    return Err(TransitionError {
                        conversation: self.name.clone(),
                        state,
                    }
                    .into());
                }
                if !self.stamp_matches(store, &key, seen).await? {
                    return Ok(());
                }
                let generation = match (stage, &current) {
                    (Stage::State | Stage::Fallback, Some(record)) => record.generation,
                    _ => self.next_generation(seen),
                };
                let record = ConversationRecord {
                    state,
                    generation,
                    updated_at_ms: now_ms(),
                };
                store.save(&self.name, &key, &record).await?;
                if Some(generation) == seen {
                    debug!(conversation = %self.name, %key, state = %record.state, "Conversation moved");
                } else {
                    info!(conversation = %self.name, %key, state = %record.state, "Conversation started");
                }
                self.arm_timer(key, generation, ctx);
            }
            Transition::End => {
                store.remove(&self.name, &key).await?;
                self.timers.cancel(&key);
                if current.is_some() {
                    info!(conversation = %self.name, %key, "Conversation ended");
                }
            }
        }
        Ok(())
    }

    /// Whether the stored generation is still the one routing was based on.
    async fn stamp_matches(
        &self,
        store: &Arc<dyn ConversationStore>,
        key: &ConversationKey,
        seen: Option<u64>,
    ) -> StoreResult<bool> {
        let stored = store.load(&self.name, key).await?.map(|r| r.generation);
        if stored != seen {
            warn!(
                conversation = %self.name,
                %key,
                ?seen,
                ?stored,
                "Conversation changed underneath a callback, transition discarded"
            );
            return Ok(false);
        }
        Ok(true)
    }

    // ─── Timeouts ────────────────────────────────────────────────────────────

    fn arm_timer(self: &Arc<Self>, key: ConversationKey, generation: u64, ctx: &CallbackContext) {
        if let Some(delay) = self.timeout {
            self.spawn_timer(key, generation, delay, Some(Origin::of(ctx)));
        }
    }

    fn spawn_timer(
        self: &Arc<Self>,
        key: ConversationKey,
        generation: u64,
        delay: Duration,
        origin: Option<Origin>,
    ) {
        let handle = self.timers.arm(key, generation);
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            tokio::select! {
                _ = handle.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            inner.expire(key, handle, origin).await;
        });
    }

    /// Arms timers for the records already in the store.
    ///
    /// The update that last touched a restored record is unknown, so when
    /// such a timer fires the record is removed without running the timeout
    /// handlers.
    async fn restore_timers(self: Arc<Self>, delay: Duration) {
        let Ok(store) = self.store().map(Arc::clone) else {
            return;
        };
        let records = match store.list(&self.name).await {
            Ok(records) => records,
            Err(e) => {
                error!(conversation = %self.name, error = %e, "Failed to list stored conversations");
                return;
            }
        };

        let now = now_ms();
        let mut restored = 0;
        for (key, record) in records {
            let lock = self.key_lock(key);
            {
                let _guard = lock.lock().await;
                if !self.timers.contains(&key) {
                    let idle = Duration::from_millis(now.saturating_sub(record.updated_at_ms));
                    self.spawn_timer(key, record.generation, delay.saturating_sub(idle), None);
                    restored += 1;
                }
            }
            self.release_lock(&key, lock);
        }
        if restored > 0 {
            debug!(conversation = %self.name, restored, "Re-armed timers of stored conversations");
        }
    }

    async fn expire(&self, key: ConversationKey, handle: TimerHandle, origin: Option<Origin>) {
        let lock = self.key_lock(key);
        {
            let _guard = lock.lock().await;
            if self.timers.is_current(&key, &handle) {
                self.run_timeout(key, &handle, origin.as_ref()).await;
            }
        }
        self.release_lock(&key, lock);
    }

    async fn run_timeout(&self, key: ConversationKey, handle: &TimerHandle, origin: Option<&Origin>) {
        let store = match self.store() {
            Ok(store) => store,
            Err(e) => return self.report_store_error(origin, e).await,
        };
        match store.load(&self.name, &key).await {
            Ok(Some(record)) if record.generation == handle.generation => {}
            Ok(_) => return self.timers.finish(&key, handle),
            Err(e) => return self.report_store_error(origin, e).await,
        }
        self.time_out(key, origin).await;
        self.timers.finish(&key, handle);
    }

    /// Runs the first matching timeout handler and removes the conversation.
    /// Called with the key locked.
    async fn time_out(&self, key: ConversationKey, origin: Option<&Origin>) {
        if let Some(origin) = origin {
            self.run_timeout_handler(key, origin).await;
        }
        let removed = match self.store() {
            Ok(store) => store.remove(&self.name, &key).await,
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            self.report_store_error(origin, e).await;
        }
        info!(conversation = %self.name, %key, "Conversation timed out");
    }

    async fn run_timeout_handler(&self, key: ConversationKey, origin: &Origin) {
        let Some((handler, matched)) = self.first_match(&self.timeout_handlers, &origin.update).await
        else {
            return;
        };
        let marker = TimeoutExpired {
            conversation: self.name.clone(),
            key,
        };
        let ctx = CallbackContext::new(Arc::clone(&origin.update), origin.env.clone())
            .with_timeout(marker);
        match handler.handle(Arc::new(ctx), matched).await {
            Ok(Transition::To(state)) => {
                debug!(conversation = %self.name, %state, "Transition from timeout handler ignored");
            }
            Ok(_) => {}
            Err(e) => {
                let failure = HandlerFailure::new(handler.name(), Arc::clone(&origin.update), e);
                origin.env.report(failure).await;
            }
        }
    }

    async fn report_store_error(&self, origin: Option<&Origin>, error: StoreError) {
        match origin {
            Some(origin) => {
                let failure =
                    HandlerFailure::new(self.name.clone(), Arc::clone(&origin.update), error.into());
                origin.env.report(failure).await;
            }
            None => error!(conversation = %self.name, error = %error, "Conversation store failed"),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// =============================================================================
// ConversationBuilder
// =============================================================================

/// Builder for [`ConversationHandler`].
#[must_use = "call `.build()` to create the conversation"]
pub struct ConversationBuilder {
    name: String,
    entry_points: Vec<BoxedUpdateHandler>,
    states: HashMap<State, Vec<BoxedUpdateHandler>>,
    fallbacks: Vec<BoxedUpdateHandler>,
    timeout_handlers: Vec<BoxedUpdateHandler>,
    per_chat: bool,
    per_user: bool,
    collision: EntryCollision,
    timeout: Option<Duration>,
    block: Option<bool>,
    persistent: bool,
    store: Option<Arc<dyn ConversationStore>>,
}

impl ConversationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry_points: Vec::new(),
            states: HashMap::new(),
            fallbacks: Vec::new(),
            timeout_handlers: Vec::new(),
            per_chat: true,
            per_user: true,
            collision: EntryCollision::default(),
            timeout: None,
            block: None,
            persistent: false,
            store: None,
        }
    }

    /// Starts from configured defaults.
    pub fn from_config(name: impl Into<String>, config: &ConversationConfig) -> Self {
        let mut builder = Self::new(name);
        builder.timeout = config.timeout();
        builder.collision = config.collision;
        builder.persistent = config.persistent;
        builder
    }

    /// Adds a handler that can start the conversation.
    pub fn entry_point(mut self, handler: impl UpdateHandler) -> Self {
        self.entry_points.push(Arc::new(handler));
        self
    }

    /// Declares a state and its handlers. The list may be empty.
    pub fn state<I, H>(mut self, state: impl Into<State>, handlers: I) -> Self
    where
        I: IntoIterator<Item = H>,
        H: UpdateHandler,
    {
        let entry = self.states.entry(state.into()).or_default();
        entry.extend(
            handlers
                .into_iter()
                .map(|h| Arc::new(h) as BoxedUpdateHandler),
        );
        self
    }

    /// Adds a handler tried in any state when no state handler matches.
    pub fn fallback(mut self, handler: impl UpdateHandler) -> Self {
        self.fallbacks.push(Arc::new(handler));
        self
    }

    /// Adds a handler tried once when the conversation times out.
    pub fn timeout_handler(mut self, handler: impl UpdateHandler) -> Self {
        self.timeout_handlers.push(Arc::new(handler));
        self
    }

    pub fn per_chat(mut self, per_chat: bool) -> Self {
        self.per_chat = per_chat;
        self
    }

    pub fn per_user(mut self, per_user: bool) -> Self {
        self.per_user = per_user;
        self
    }

    pub fn collision(mut self, collision: EntryCollision) -> Self {
        self.collision = collision;
        self
    }

    /// Sets the idle timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the dispatcher's default blocking behaviour for the whole
    /// conversation.
    pub fn block(mut self, block: bool) -> Self {
        self.block = Some(block);
        self
    }

    /// Keeps state in the dispatcher's persistent store.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Uses a specific store instead of the default.
    pub fn store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validates the configuration and builds the handler.
    pub fn build(self) -> RegistrationResult<ConversationHandler> {
        if self.entry_points.is_empty() {
            return Err(RegistrationError::NoEntryPoints(self.name));
        }
        if !self.per_chat && !self.per_user {
            return Err(RegistrationError::EmptyKeyScope(self.name));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(RegistrationError::ZeroTimeout(self.name));
        }
        if !self.timeout_handlers.is_empty() && self.timeout.is_none() {
            return Err(RegistrationError::TimeoutHandlersWithoutTimeout(self.name));
        }

        let inner_handlers = self
            .entry_points
            .iter()
            .chain(self.states.values().flatten())
            .chain(&self.fallbacks)
            .chain(&self.timeout_handlers);
        for handler in inner_handlers {
            if handler.block() == Some(false) {
                warn!(
                    conversation = %self.name,
                    handler = handler.name(),
                    "Handlers inside a conversation always run inline"
                );
            }
        }

        let store = OnceLock::new();
        match self.store {
            Some(explicit) => {
                let _ = store.set(explicit);
            }
            None if !self.persistent => {
                let _ = store.set(Arc::new(InMemoryStore::new()) as Arc<dyn ConversationStore>);
            }
            None => {}
        }

        Ok(ConversationHandler {
            inner: Arc::new(Inner {
                name: self.name,
                entry_points: self.entry_points,
                states: self.states,
                fallbacks: self.fallbacks,
                timeout_handlers: self.timeout_handlers,
                per_chat: self.per_chat,
                per_user: self.per_user,
                collision: self.collision,
                timeout: self.timeout,
                block: self.block,
                persistent: self.persistent,
                registered: AtomicBool::new(false),
                store,
                locks: DashMap::new(),
                reserved: DashMap::new(),
                timers: TimeoutScheduler::default(),
                generation: AtomicU64::new(0),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::chain::ErrorChain;
    use crate::error::DispatchError;
    use crate::filter;
    use crate::routing::{on_command, on_message, on_update};
    use courier_core::{Chat, Message, UpdateKind, User};

    fn env() -> DispatchEnv {
        DispatchEnv::new(None, Arc::new(ErrorChain::default()))
    }

    fn text(id: i64, user: i64, text: &str) -> Update {
        let msg = Message::new(id, Chat::group(-100, "g"))
            .with_from(User::new(user, "U"))
            .with_text(text);
        Update::message_update(id, msg)
    }

    fn key(user: i64) -> ConversationKey {
        ConversationKey::new(Some(-100), Some(user))
    }

    /// Mimics one dispatcher pass over a single conversation.
    async fn feed(
        conv: &ConversationHandler,
        env: &DispatchEnv,
        update: Update,
    ) -> Option<DispatchResult<Transition>> {
        let update = Arc::new(update);
        let matched = conv.check(&update).await.unwrap();
        if !matched.is_match() {
            return None;
        }
        let ctx = Arc::new(CallbackContext::new(update, env.clone()));
        Some(conv.handle(ctx, matched).await)
    }

    fn signup() -> ConversationBuilder {
        ConversationHandler::builder("signup")
            .entry_point(on_command(["start"]).callback(|| async { State::new("NAME") }))
            .state(
                "NAME",
                [
                    on_message(filter::text_equals("done")).callback(|| async { Transition::End }),
                    on_message(filter::text_equals("next")).callback(|| async { State::new("AGE") }),
                    on_message(filter::text()).callback(|| async {}),
                ],
            )
            .state("AGE", Vec::<crate::handler::Handler>::new())
            .fallback(on_command(["cancel"]).callback(|| async { Transition::End }))
    }

    #[tokio::test]
    async fn test_transitions() {
        let conv = signup().build().unwrap();
        let env = env();

        assert!(feed(&conv, &env, text(1, 7, "hello")).await.is_none());

        feed(&conv, &env, text(2, 7, "/start")).await.unwrap().unwrap();
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), Some(State::new("NAME")));

        feed(&conv, &env, text(3, 7, "anything")).await.unwrap().unwrap();
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), Some(State::new("NAME")));

        // other users are independent
        assert_eq!(conv.current_state(&key(8)).await.unwrap(), None);

        feed(&conv, &env, text(4, 7, "done")).await.unwrap().unwrap();
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fallback_applies_in_states_without_handlers() {
        let conv = signup().build().unwrap();
        let env = env();

        feed(&conv, &env, text(1, 7, "/start")).await.unwrap().unwrap();
        feed(&conv, &env, text(2, 7, "next")).await.unwrap().unwrap();
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), Some(State::new("AGE")));

        assert!(feed(&conv, &env, text(3, 7, "42")).await.is_none());
        feed(&conv, &env, text(4, 7, "/cancel")).await.unwrap().unwrap();
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), None);

        // fallbacks never start a conversation
        assert!(feed(&conv, &env, text(5, 7, "/cancel")).await.is_none());
    }

    #[tokio::test]
    async fn test_undeclared_state_terminates() {
        let conv = ConversationHandler::builder("broken")
            .entry_point(on_command(["start"]).callback(|| async { State::new("A") }))
            .state(
                "A",
                [on_message(filter::text()).callback(|| async { State::new("NOWHERE") })],
            )
            .build()
            .unwrap();
        let env = env();

        feed(&conv, &env, text(1, 7, "/start")).await.unwrap().unwrap();
        let err = feed(&conv, &env, text(2, 7, "x")).await.unwrap().unwrap_err();
        match err {
            DispatchError::Transition(e) => assert_eq!(e.state, State::new("NOWHERE")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_callback_error_keeps_state() {
        let conv = ConversationHandler::builder("flaky")
            .entry_point(on_command(["start"]).callback(|| async { State::new("A") }))
            .state(
                "A",
                [on_message(filter::text()).callback(|| async { Err::<State, _>("nope") })],
            )
            .build()
            .unwrap();
        let env = env();

        feed(&conv, &env, text(1, 7, "/start")).await.unwrap().unwrap();
        assert!(feed(&conv, &env, text(2, 7, "x")).await.unwrap().is_err());
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), Some(State::new("A")));
    }

    fn two_step(collision: EntryCollision, store: Arc<InMemoryStore>) -> ConversationHandler {
        ConversationHandler::builder("two_step")
            .entry_point(on_command(["start"]).callback(|| async { State::new("A") }))
            .state(
                "A",
                [on_message(filter::text()).callback(|| async { State::new("B") })],
            )
            .state(
                "B",
                [on_message(filter::text()).callback(|| async {})],
            )
            .collision(collision)
            .store(store)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_collision_block_routes_to_active_state() {
        let store = Arc::new(InMemoryStore::new());
        let conv = two_step(EntryCollision::Block, store);
        let env = env();

        feed(&conv, &env, text(1, 7, "/start")).await.unwrap().unwrap();
        feed(&conv, &env, text(2, 7, "x")).await.unwrap().unwrap();
        // "/start" is text, so the state handler takes it
        feed(&conv, &env, text(3, 7, "/start")).await.unwrap().unwrap();
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), Some(State::new("B")));
    }

    #[tokio::test]
    async fn test_collision_replace_restarts() {
        let store = Arc::new(InMemoryStore::new());
        let conv = two_step(EntryCollision::Replace, store.clone());
        let env = env();

        feed(&conv, &env, text(1, 7, "/start")).await.unwrap().unwrap();
        feed(&conv, &env, text(2, 7, "x")).await.unwrap().unwrap();
        let before = store.load("two_step", &key(7)).await.unwrap().unwrap();
        assert_eq!(before.state, State::new("B"));

        feed(&conv, &env, text(3, 7, "/start")).await.unwrap().unwrap();
        let after = store.load("two_step", &key(7)).await.unwrap().unwrap();
        assert_eq!(after.state, State::new("A"));
        assert!(after.generation > before.generation);
    }

    #[tokio::test]
    async fn test_collision_discard_rejects_entry() {
        let store = Arc::new(InMemoryStore::new());
        let conv = two_step(EntryCollision::Discard, store);
        let env = env();

        feed(&conv, &env, text(1, 7, "/start")).await.unwrap().unwrap();
        assert!(feed(&conv, &env, text(2, 7, "/start")).await.is_none());
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), Some(State::new("A")));

        // non-entry updates are still routed
        feed(&conv, &env, text(3, 7, "x")).await.unwrap().unwrap();
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), Some(State::new("B")));
    }

    #[tokio::test]
    async fn test_collision_discard_while_busy() {
        let store = Arc::new(InMemoryStore::new());
        let conv = two_step(EntryCollision::Discard, store);

        let lock = conv.inner.key_lock(key(7));
        let guard = lock.lock().await;
        let update = text(1, 7, "/start");
        assert!(!conv.check(&update).await.unwrap().is_match());
        drop(guard);
        conv.inner.release_lock(&key(7), lock);
        assert!(conv.check(&update).await.unwrap().is_match());
    }

    #[tokio::test]
    async fn test_follow_up_waits_for_accepted_entry() {
        let conv = signup().build().unwrap();
        let env = env();
        let start = Arc::new(text(1, 7, "/start"));
        let next = Arc::new(text(2, 7, "next"));

        // both are accepted before either runs; "next" is not an entry point
        let first = conv.check(&start).await.unwrap();
        let second = conv.check(&next).await.unwrap();
        assert!(first.is_match());
        assert!(second.is_match());

        let (conv, env) = (&conv, &env);
        let run = move |update: &Arc<Update>, matched: MatchResult| {
            let ctx = Arc::new(CallbackContext::new(Arc::clone(update), env.clone()));
            conv.handle(ctx, matched)
        };
        // the follow-up is polled first and still runs after the entry
        let (b, a) = tokio::join!(run(&next, second), run(&start, first));
        a.unwrap();
        b.unwrap();
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), Some(State::new("AGE")));
        assert!(conv.inner.reserved.is_empty());
        assert!(conv.inner.locks.is_empty());
    }

    #[tokio::test]
    async fn test_busy_key_without_any_matching_handler() {
        let conv = signup().build().unwrap();
        let start = text(1, 7, "/start");
        assert!(conv.check(&start).await.unwrap().is_match());

        let photo = Update::message_update(
            2,
            Message::new(2, Chat::group(-100, "g")).with_from(User::new(7, "U")),
        );
        assert!(!conv.check(&photo).await.unwrap().is_match());
        // another key is unaffected
        assert!(conv.check(&text(3, 8, "/start")).await.unwrap().is_match());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_is_serialized() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let overlap = {
            let active = active.clone();
            let peak = peak.clone();
            move || {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    State::new("A")
                }
            }
        };
        let conv = ConversationHandler::builder("overlap")
            .entry_point(on_message(filter::text()).callback(overlap.clone()))
            .state("A", [on_message(filter::text()).callback(overlap)])
            .build()
            .unwrap();
        let env = env();

        let (a, b, c) = tokio::join!(
            feed(&conv, &env, text(1, 7, "one")),
            feed(&conv, &env, text(2, 7, "two")),
            feed(&conv, &env, text(3, 8, "other user")),
        );
        a.unwrap().unwrap();
        b.unwrap().unwrap();
        c.unwrap().unwrap();

        // the two updates of user 7 never overlapped; user 8 ran alongside
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert!(conv.inner.locks.is_empty());
    }

    fn timed(fired: Arc<AtomicUsize>) -> ConversationHandler {
        timed_builder(fired).build().unwrap()
    }

    fn timed_builder(fired: Arc<AtomicUsize>) -> ConversationBuilder {
        ConversationHandler::builder("timed")
            .entry_point(on_command(["start"]).callback(|| async { State::new("A") }))
            .state("A", [on_message(filter::text()).callback(|| async {})])
            .timeout(Duration::from_secs(10))
            .timeout_handler(on_update(filter::all()).callback(
                move |expired: TimeoutExpired| {
                    let fired = fired.clone();
                    async move {
                        assert_eq!(expired.conversation, "timed");
                        fired.fetch_add(1, Ordering::SeqCst);
                        // ignored: the conversation is removed regardless
                        State::new("A")
                    }
                },
            ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once_and_removes() {
        let fired = Arc::new(AtomicUsize::new(0));
        let conv = timed(fired.clone());
        let env = env();

        feed(&conv, &env, text(1, 7, "/start")).await.unwrap().unwrap();
        assert_eq!(conv.pending_timeouts(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), None);
        assert_eq!(conv.pending_timeouts(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_timeout() {
        let fired = Arc::new(AtomicUsize::new(0));
        let conv = timed(fired.clone());
        let env = env();

        feed(&conv, &env, text(1, 7, "/start")).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        feed(&conv, &env, text(2, 7, "still here")).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), Some(State::new("A")));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_stored_record_expires_on_next_update() {
        let fired = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryStore::new());
        let stale = ConversationRecord {
            state: State::new("A"),
            generation: 7,
            updated_at_ms: now_ms() - 60_000,
        };
        store.save("timed", &key(7), &stale).await.unwrap();
        let conv = timed_builder(fired.clone()).store(store.clone()).build().unwrap();
        let env = env();

        // the expired state no longer routes text
        assert!(feed(&conv, &env, text(1, 7, "hello")).await.is_none());

        feed(&conv, &env, text(2, 7, "/start")).await.unwrap().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let record = store.load("timed", &key(7)).await.unwrap().unwrap();
        assert_eq!(record.state, State::new("A"));
        assert_ne!(record.generation, 7);
        assert_eq!(conv.pending_timeouts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_records_get_timers() {
        let fired = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryStore::new());
        let idle = ConversationRecord {
            state: State::new("A"),
            generation: 3,
            updated_at_ms: now_ms() - 4_000,
        };
        let expired = ConversationRecord {
            state: State::new("A"),
            generation: 4,
            updated_at_ms: 0,
        };
        store.save("timed", &key(7), &idle).await.unwrap();
        store.save("timed", &key(8), &expired).await.unwrap();

        let conv = timed_builder(fired.clone()).store(store.clone()).build().unwrap();
        conv.on_register(&Registration {
            group: 0,
            persistence: None,
            bot: None,
        })
        .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(conv.current_state(&key(8)).await.unwrap(), None);
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), Some(State::new("A")));
        assert_eq!(conv.pending_timeouts(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(conv.current_state(&key(7)).await.unwrap(), None);
        assert_eq!(conv.pending_timeouts(), 0);
        // there is no update to hand the timeout handlers
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_cancels_timeout() {
        let fired = Arc::new(AtomicUsize::new(0));
        let conv = ConversationHandler::builder("short")
            .entry_point(on_command(["start"]).callback(|| async { State::new("A") }))
            .state("A", [on_message(filter::text()).callback(|| async { Transition::End })])
            .timeout(Duration::from_secs(5))
            .timeout_handler(on_update(filter::all()).callback({
                let fired = fired.clone();
                move || {
                    let fired = fired.clone();
                    async move {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }))
            .build()
            .unwrap();
        let env = env();

        feed(&conv, &env, text(1, 7, "/start")).await.unwrap().unwrap();
        feed(&conv, &env, text(2, 7, "bye")).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(conv.pending_timeouts(), 0);
    }

    #[test]
    fn test_build_validation() {
        let entry = || on_command(["start"]).callback(|| async {});

        let err = ConversationHandler::builder("x").build().unwrap_err();
        assert!(matches!(err, RegistrationError::NoEntryPoints(_)));

        let err = ConversationHandler::builder("x")
            .entry_point(entry())
            .per_chat(false)
            .per_user(false)
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistrationError::EmptyKeyScope(_)));

        let err = ConversationHandler::builder("x")
            .entry_point(entry())
            .timeout_handler(entry())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::TimeoutHandlersWithoutTimeout(_)
        ));

        let err = ConversationHandler::builder("x")
            .entry_point(entry())
            .timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistrationError::ZeroTimeout(_)));
    }

    #[tokio::test]
    async fn test_persistent_store_is_injected() {
        let conv = ConversationHandler::builder("saved")
            .entry_point(on_command(["start"]).callback(|| async { State::new("A") }))
            .state("A", Vec::<crate::handler::Handler>::new())
            .persistent(true)
            .build()
            .unwrap();
        assert!(conv.current_state(&key(7)).await.is_err());

        let missing = Registration {
            group: 0,
            persistence: None,
            bot: None,
        };
        assert!(matches!(
            conv.on_register(&missing),
            Err(RegistrationError::MissingPersistence(_))
        ));

        let store: Arc<dyn ConversationStore> = Arc::new(InMemoryStore::new());
        let registration = Registration {
            group: 0,
            persistence: Some(&store),
            bot: None,
        };
        conv.on_register(&registration).unwrap();
        assert!(matches!(
            conv.on_register(&registration),
            Err(RegistrationError::AlreadyRegistered(_))
        ));

        feed(&conv, &env(), text(1, 7, "/start")).await.unwrap().unwrap();
        let record = store.load("saved", &key(7)).await.unwrap().unwrap();
        assert_eq!(record.state, State::new("A"));
    }

    #[test]
    fn test_keying() {
        let per_chat = ConversationHandler::builder("chat")
            .entry_point(on_command(["start"]).callback(|| async {}))
            .per_user(false)
            .build()
            .unwrap();
        assert_eq!(
            per_chat.key_for(&text(1, 7, "hi")),
            Some(ConversationKey::new(Some(-100), None))
        );

        let post = Update::new(
            2,
            UpdateKind::ChannelPost(Message::new(1, Chat::new(-9, courier_core::ChatType::Channel))),
        );
        assert_eq!(per_chat.key_for(&post), None);
    }
}
