//! Extractor system for the Courier framework.
//!
//! This module provides the [`FromContext`] trait, which defines how types
//! can be extracted from a [`CallbackContext`] for use as callback parameters.
//!
//! ```rust,ignore
//! async fn greet(msg: Message, bot: BoxedBot, CommandArgs(args): CommandArgs) -> anyhow::Result<()> {
//!     bot.send_message(msg.chat.id, &format!("hello {}", args.join(" "))).await?;
//!     Ok(())
//! }
//! ```
//!
//! A failed extraction aborts the callback with [`ExtractError`], which is
//! routed to the error-handler chain. Wrap a parameter in `Option<T>` to make
//! it optional.

use std::sync::Arc;

use serde_json::Value;

use courier_core::{
    BoxedBot, CallbackQuery, Chat, ChatJoinRequest, ChatMemberUpdated, InlineQuery, Message,
    Update, User,
};

use crate::context::{CallbackContext, SharedData};
use crate::conversation::TimeoutExpired;
use crate::error::{ExtractError, ExtractResult, HandlerFailure};
use crate::filter::MatchData;

/// A trait for types that can be extracted from a [`CallbackContext`].
///
/// Types implementing this trait can be used directly as callback
/// parameters.
///
/// ```rust,ignore
/// struct Lang(String);
///
/// impl FromContext for Lang {
///     fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
///         let user = ctx.update().effective_user().ok_or(ExtractError::Missing("user"))?;
///         Ok(Lang(user.language_code.clone().unwrap_or_else(|| "en".into())))
///     }
/// }
/// ```
pub trait FromContext: Sized {
    /// Attempts to extract this type from the given context.
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self>;
}

/// Implementation for `Option<T>` where `T: FromContext`.
///
/// Never fails; a failed inner extraction yields `None`.
impl<T: FromContext> FromContext for Option<T> {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        Ok(T::from_context(ctx).ok())
    }
}

impl FromContext for Arc<Update> {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        Ok(Arc::clone(ctx.update()))
    }
}

/// The effective message of the update.
impl FromContext for Message {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.update()
            .effective_message()
            .cloned()
            .ok_or(ExtractError::Missing("message"))
    }
}

impl FromContext for CallbackQuery {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.update()
            .callback_query()
            .cloned()
            .ok_or(ExtractError::Missing("callback query"))
    }
}

impl FromContext for InlineQuery {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.update()
            .inline_query()
            .cloned()
            .ok_or(ExtractError::Missing("inline query"))
    }
}

impl FromContext for ChatJoinRequest {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.update()
            .chat_join_request()
            .cloned()
            .ok_or(ExtractError::Missing("chat join request"))
    }
}

impl FromContext for ChatMemberUpdated {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.update()
            .chat_member()
            .cloned()
            .ok_or(ExtractError::Missing("chat member update"))
    }
}

/// The effective user of the update.
impl FromContext for User {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.update()
            .effective_user()
            .cloned()
            .ok_or(ExtractError::Missing("user"))
    }
}

/// The effective chat of the update.
impl FromContext for Chat {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.update()
            .effective_chat()
            .cloned()
            .ok_or(ExtractError::Missing("chat"))
    }
}

/// The bot attached to the dispatcher.
impl FromContext for BoxedBot {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.bot().cloned().ok_or(ExtractError::BotUnavailable)
    }
}

/// The context itself, for callbacks that need more than one piece of it.
impl FromContext for Arc<CallbackContext> {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        Ok(Arc::clone(ctx))
    }
}

// =============================================================================
// Newtype extractors
// =============================================================================

/// All match data produced by the handler's filter.
#[derive(Debug, Clone, Default)]
pub struct Matches(pub MatchData);

impl Matches {
    /// Looks up one value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl FromContext for Matches {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        Ok(Matches(ctx.matches()))
    }
}

/// Whitespace-separated command arguments, empty when none were given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandArgs(pub Vec<String>);

impl FromContext for CommandArgs {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        match ctx.match_value("args") {
            None => Ok(CommandArgs::default()),
            Some(value) => serde_json::from_value(value)
                .map(CommandArgs)
                .map_err(|e| ExtractError::MalformedMatch {
                    key: "args".to_string(),
                    reason: e.to_string(),
                }),
        }
    }
}

/// Data of the update's effective chat.
#[derive(Debug, Clone)]
pub struct ChatData(pub SharedData);

impl FromContext for ChatData {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.chat_data()
            .map(ChatData)
            .ok_or(ExtractError::Missing("chat"))
    }
}

/// Data of the update's effective user.
#[derive(Debug, Clone)]
pub struct UserData(pub SharedData);

impl FromContext for UserData {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.user_data()
            .map(UserData)
            .ok_or(ExtractError::Missing("user"))
    }
}

/// Data shared by all updates.
#[derive(Debug, Clone)]
pub struct BotData(pub SharedData);

impl FromContext for BotData {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        Ok(BotData(ctx.bot_data()))
    }
}

/// The failure being handled. Only available inside error handlers.
#[derive(Debug, Clone)]
pub struct Failure(pub Arc<HandlerFailure>);

impl FromContext for Failure {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.failure()
            .cloned()
            .map(Failure)
            .ok_or(ExtractError::Missing("failure"))
    }
}

/// Only available inside conversation timeout handlers.
impl FromContext for TimeoutExpired {
    fn from_context(ctx: &Arc<CallbackContext>) -> ExtractResult<Self> {
        ctx.timeout()
            .cloned()
            .ok_or(ExtractError::Missing("conversation timeout"))
    }
}
