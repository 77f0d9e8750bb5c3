//! # Courier Framework
//!
//! Update dispatch for Courier bots.
//!
//! - **Filters** ([`filter`]) – composable predicates over updates, some of
//!   which extract data for the callback
//! - **Handlers** ([`handler`], [`routing`]) – a filter paired with an
//!   Axum-style async callback and a blocking flag
//! - **Conversations** ([`conversation`]) – keyed state machines with
//!   fallbacks, idle timeouts and pluggable state storage
//! - **Dispatcher** ([`dispatcher`], [`worker`]) – ordered handler groups, a
//!   bounded worker pool for non-blocking handlers and the error-handler chain
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use courier_framework::prelude::*;
//!
//! async fn start(msg: Message, bot: BoxedBot) -> anyhow::Result<()> {
//!     bot.send_message(msg.chat.id, "Hello!").await?;
//!     Ok(())
//! }
//!
//! let dispatcher = Dispatcher::builder().bot(bot).build();
//! dispatcher.add_handler(on_command(["start"]).callback(start), 0)?;
//! let report = dispatcher.process_update(update).await;
//! ```

pub mod chain;
pub mod context;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod extractor;
pub mod filter;
pub mod handler;
pub mod routing;
pub mod transition;
pub mod worker;

pub use chain::ErrorChain;
pub use context::{CallbackContext, DataStores, DispatchEnv, SharedData};
pub use conversation::{
    ConversationBuilder, ConversationConfig, ConversationHandler, ConversationKey,
    ConversationRecord, ConversationStore, EntryCollision, InMemoryStore, JsonFileStore,
    TimeoutExpired,
};
pub use dispatcher::{
    DispatchReport, DispatchStats, Dispatcher, DispatcherBuilder, DispatcherConfig, UpdateStatus,
};
pub use error::{
    BoxError, CallbackError, DispatchError, DispatchResult, ExtractError, ExtractResult,
    FilterError, HandlerFailure, RegistrationError, RegistrationResult, StoreError,
    TransitionError,
};
pub use extractor::{
    BotData, ChatData, CommandArgs, Failure, FromContext, Matches, UserData,
};
pub use filter::{BoxedFilter, Filter, FilterResult, MatchData, MatchResult};
pub use handler::{
    BoxedUpdateHandler, Callback, Handler, HandlerBuilder, HandlerReturn, Registration,
    UpdateHandler,
};
pub use routing::{
    CallbackPattern, ChatMemberScope, JoinRequestBuilder, on_callback_query, on_chat_join_request,
    on_chat_member, on_command, on_command_for, on_inline_query, on_message, on_update,
};
pub use transition::{State, Transition};
pub use worker::{JobError, JobHandle, PoolClosed, WorkerPool};

/// Everything a bot's setup code usually needs.
pub mod prelude {
    pub use courier_core::{
        Bot, BoxedBot, CallbackQuery, Chat, ChatJoinRequest, ChatMemberUpdated, Message, Update,
        UpdateType, User,
    };

    pub use crate::conversation::{ConversationHandler, EntryCollision, TimeoutExpired};
    pub use crate::dispatcher::{Dispatcher, DispatcherConfig};
    pub use crate::extractor::{BotData, ChatData, CommandArgs, Failure, Matches, UserData};
    pub use crate::filter::{self, Filter};
    pub use crate::routing::*;
    pub use crate::transition::{State, Transition};
    pub use crate::CallbackContext;
}
