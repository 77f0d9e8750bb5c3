//! The [`UpdateHandler`] trait the dispatcher routes updates to.

use std::sync::Arc;

use async_trait::async_trait;

use courier_core::{BoxedBot, Update};

use crate::context::CallbackContext;
use crate::conversation::ConversationStore;
use crate::error::{DispatchResult, RegistrationResult};
use crate::filter::{FilterResult, MatchResult};
use crate::transition::Transition;

/// What a handler learns about the dispatcher it is being added to.
pub struct Registration<'a> {
    /// The handler group the handler is added to.
    pub group: i32,
    /// The dispatcher's conversation store for persistent conversations.
    pub persistence: Option<&'a Arc<dyn ConversationStore>>,
    /// The dispatcher's bot, if one is attached.
    pub bot: Option<&'a BoxedBot>,
}

/// A unit of update processing: a predicate plus the work to do on a match.
///
/// The dispatcher calls [`check`](UpdateHandler::check) for every candidate
/// update and, for the first handler of a group that matches, builds a fresh
/// [`CallbackContext`] and calls [`handle`](UpdateHandler::handle) with the
/// match result.
#[async_trait]
pub trait UpdateHandler: Send + Sync + 'static {
    /// Name used in logs, error reports and [`remove_handler`].
    ///
    /// [`remove_handler`]: crate::Dispatcher::remove_handler
    fn name(&self) -> &str;

    /// Whether the dispatcher awaits this handler before moving on.
    ///
    /// `None` defers to the dispatcher's configured default.
    fn block(&self) -> Option<bool> {
        None
    }

    /// Decides whether this handler wants the update.
    async fn check(&self, update: &Update) -> FilterResult;

    /// Processes an update that [`check`](UpdateHandler::check) accepted.
    async fn handle(
        &self,
        ctx: Arc<CallbackContext>,
        matched: MatchResult,
    ) -> DispatchResult<Transition>;

    /// Called once when the handler is added to a dispatcher.
    ///
    /// Misconfiguration that can only be detected against the dispatcher is
    /// reported here so registration fails loudly.
    fn on_register(&self, _registration: &Registration<'_>) -> RegistrationResult<()> {
        Ok(())
    }

    /// Called when the dispatcher shuts down. Cancels background work.
    fn on_shutdown(&self) {}
}

/// A shared handler trait object.
pub type BoxedUpdateHandler = Arc<dyn UpdateHandler>;
