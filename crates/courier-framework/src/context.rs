//! Per-invocation callback context and the stores it exposes.
//!
//! - [`DispatchEnv`]: what a dispatcher shares with the handlers it runs.
//!   Cheap to clone.
//!
//! - [`CallbackContext`]: built fresh for every handler invocation. It holds
//!   the update, the match data produced by the handler's filter, typed
//!   scratch state and, for error and timeout handlers, the failure or
//!   timeout that triggered them.
//!
//! - [`DataStores`]: `bot_data`, `chat_data` and `user_data` maps that outlive
//!   a single update, keyed by chat and user id.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use courier_core::{BoxedBot, Update};

use crate::chain::ErrorChain;
use crate::conversation::TimeoutExpired;
use crate::error::HandlerFailure;
use crate::filter::MatchData;

/// A JSON map shared between callbacks.
pub type SharedData = Arc<Mutex<serde_json::Map<String, Value>>>;

// =============================================================================
// DataStores
// =============================================================================

/// Long-lived key/value stores handed to callbacks.
#[derive(Debug, Default)]
pub struct DataStores {
    bot: SharedData,
    chats: DashMap<i64, SharedData>,
    users: DashMap<i64, SharedData>,
}

impl DataStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Data shared by every update.
    pub fn bot_data(&self) -> SharedData {
        Arc::clone(&self.bot)
    }

    /// Data for one chat, created on first access.
    pub fn chat_data(&self, chat_id: i64) -> SharedData {
        self.chats.entry(chat_id).or_default().clone()
    }

    /// Data for one user, created on first access.
    pub fn user_data(&self, user_id: i64) -> SharedData {
        self.users.entry(user_id).or_default().clone()
    }

    /// Forgets a chat's data. Returns whether anything was stored.
    pub fn drop_chat_data(&self, chat_id: i64) -> bool {
        self.chats.remove(&chat_id).is_some()
    }

    /// Forgets a user's data. Returns whether anything was stored.
    pub fn drop_user_data(&self, user_id: i64) -> bool {
        self.users.remove(&user_id).is_some()
    }
}

// =============================================================================
// DispatchEnv
// =============================================================================

/// Resources a dispatcher shares with every handler it runs.
#[derive(Clone)]
pub struct DispatchEnv {
    bot: Option<BoxedBot>,
    data: Arc<DataStores>,
    errors: Arc<ErrorChain>,
}

impl DispatchEnv {
    pub(crate) fn new(bot: Option<BoxedBot>, errors: Arc<ErrorChain>) -> Self {
        Self {
            bot,
            data: Arc::new(DataStores::new()),
            errors,
        }
    }

    /// The bot attached to the dispatcher, if any.
    pub fn bot(&self) -> Option<&BoxedBot> {
        self.bot.as_ref()
    }

    /// The long-lived data stores.
    pub fn data(&self) -> &Arc<DataStores> {
        &self.data
    }

    /// Hands a failure to the error-handler chain.
    ///
    /// Never fails: if the chain is empty or an error handler fails itself,
    /// the failure is logged instead.
    pub async fn report(&self, failure: HandlerFailure) {
        self.errors.dispatch(failure, self).await;
    }
}

impl std::fmt::Debug for DispatchEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEnv")
            .field("has_bot", &self.bot.is_some())
            .field("error_handlers", &self.errors.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// CallbackContext
// =============================================================================

/// The context object passed to callbacks.
///
/// # Example
///
/// ```rust,ignore
/// async fn remember(ctx: Arc<CallbackContext>) {
///     if let Some(chat) = ctx.chat_data() {
///         chat.lock().insert("seen".into(), true.into());
///     }
///     let args = ctx.args();
/// }
/// ```
pub struct CallbackContext {
    update: Arc<Update>,
    env: DispatchEnv,
    matches: Mutex<MatchData>,
    state: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    failure: Option<Arc<HandlerFailure>>,
    timeout: Option<TimeoutExpired>,
}

impl CallbackContext {
    /// Creates a context for one handler invocation.
    pub fn new(update: Arc<Update>, env: DispatchEnv) -> Self {
        Self {
            update,
            env,
            matches: Mutex::new(MatchData::new()),
            state: Mutex::new(HashMap::new()),
            failure: None,
            timeout: None,
        }
    }

    pub(crate) fn with_failure(mut self, failure: Arc<HandlerFailure>) -> Self {
        self.failure = Some(failure);
        self
    }

    pub(crate) fn with_timeout(mut self, timeout: TimeoutExpired) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The update being handled.
    pub fn update(&self) -> &Arc<Update> {
        &self.update
    }

    /// The bot attached to the dispatcher, if any.
    pub fn bot(&self) -> Option<&BoxedBot> {
        self.env.bot()
    }

    /// The dispatcher environment.
    pub fn env(&self) -> &DispatchEnv {
        &self.env
    }

    // ─── Match data ──────────────────────────────────────────────────────────

    /// Merges filter data into the context. Later writes win.
    pub fn merge_matches(&self, data: MatchData) {
        self.matches.lock().extend(data);
    }

    /// A snapshot of all match data.
    pub fn matches(&self) -> MatchData {
        self.matches.lock().clone()
    }

    /// A single match-data value.
    pub fn match_value(&self, key: &str) -> Option<Value> {
        self.matches.lock().get(key).cloned()
    }

    /// Command arguments extracted by a command filter, or an empty list.
    pub fn args(&self) -> Vec<String> {
        match self.matches.lock().get("args") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    // ─── Data stores ─────────────────────────────────────────────────────────

    /// Data shared by every update.
    pub fn bot_data(&self) -> SharedData {
        self.env.data.bot_data()
    }

    /// Data of the update's effective chat.
    pub fn chat_data(&self) -> Option<SharedData> {
        let chat = self.update.effective_chat()?;
        Some(self.env.data.chat_data(chat.id))
    }

    /// Data of the update's effective user.
    pub fn user_data(&self) -> Option<SharedData> {
        let user = self.update.effective_user()?;
        Some(self.env.data.user_data(user.id))
    }

    // ─── Error / timeout handlers ────────────────────────────────────────────

    /// The failure being handled, inside an error handler.
    pub fn failure(&self) -> Option<&Arc<HandlerFailure>> {
        self.failure.as_ref()
    }

    /// The expired conversation, inside a timeout handler.
    pub fn timeout(&self) -> Option<&TimeoutExpired> {
        self.timeout.as_ref()
    }

    // ─── Typed scratch state ─────────────────────────────────────────────────

    /// Stores a value for the rest of this invocation.
    pub fn set_state<T: Send + Sync + 'static>(&self, value: T) {
        self.state.lock().insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Returns a clone of a stored value.
    pub fn get_state<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.state
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Removes and returns a stored value.
    pub fn take_state<T: Send + Sync + 'static>(&self) -> Option<T> {
        self.state
            .lock()
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    /// Whether a value of type `T` is stored.
    pub fn has_state<T: Send + Sync + 'static>(&self) -> bool {
        self.state.lock().contains_key(&TypeId::of::<T>())
    }
}

impl std::fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackContext")
            .field("update_id", &self.update.update_id)
            .field("matches", &*self.matches.lock())
            .field("failure", &self.failure.as_ref().map(|e| e.to_string()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{Chat, Message, User};
    use serde_json::json;

    fn ctx() -> CallbackContext {
        let msg = Message::new(1, Chat::group(-7, "g"))
            .with_from(User::new(3, "U"))
            .with_text("/go");
        let env = DispatchEnv::new(None, Arc::new(ErrorChain::default()));
        CallbackContext::new(Arc::new(Update::message_update(1, msg)), env)
    }

    #[test]
    fn test_matches_merge_last_writer_wins() {
        let ctx = ctx();
        let mut first = MatchData::new();
        first.insert("k".into(), json!(1));
        ctx.merge_matches(first);
        let mut second = MatchData::new();
        second.insert("k".into(), json!(2));
        second.insert("args".into(), json!(["x", "y"]));
        ctx.merge_matches(second);

        assert_eq!(ctx.match_value("k"), Some(json!(2)));
        assert_eq!(ctx.args(), vec!["x", "y"]);
    }

    #[test]
    fn test_chat_and_user_data_are_shared() {
        let ctx = ctx();
        ctx.chat_data().unwrap().lock().insert("n".into(), json!(1));

        let stored = ctx.env().data().chat_data(-7);
        assert_eq!(stored.lock()["n"], json!(1));
        assert!(ctx.user_data().unwrap().lock().is_empty());
        assert!(ctx.env().data().drop_chat_data(-7));
    }

    #[test]
    fn test_typed_state() {
        let ctx = ctx();
        ctx.set_state(42_u32);
        assert!(ctx.has_state::<u32>());
        assert_eq!(ctx.get_state::<u32>(), Some(42));
        assert_eq!(ctx.take_state::<u32>(), Some(42));
        assert!(!ctx.has_state::<u32>());
    }
}
