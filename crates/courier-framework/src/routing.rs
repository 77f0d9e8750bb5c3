//! Constructors for the common handler kinds.
//!
//! Each function returns a [`HandlerBuilder`] whose filter already restricts
//! the update kind. Finish it with `.callback(f)`:
//!
//! ```rust,ignore
//! dispatcher.add_handler(on_command(["start"]).callback(start), 0)?;
//! dispatcher.add_handler(on_message(filter::text()).block(false).callback(echo), 0)?;
//! dispatcher.add_handler(on_callback_query(CallbackPattern::prefix("vote:")).callback(vote), 0)?;
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde_json::{Value, json};

use courier_core::UpdateType;

use crate::filter::{self, BoxedFilter, Filter, MatchData, data_filter_fn, filter_fn};
use crate::handler::HandlerBuilder;

/// Any update accepted by `filter`.
pub fn on_update(filter: impl Filter) -> HandlerBuilder {
    HandlerBuilder::new("update", filter)
}

/// New messages, edited messages and channel posts accepted by `filter`.
///
/// Callback queries never match, even though they may carry a message.
pub fn on_message(filter: impl Filter) -> HandlerBuilder {
    let messages = filter_fn("messages", |u| u.update_type().is_message());
    HandlerBuilder::new("message", messages.and(filter))
}

/// Messages invoking one of `names`, in any letter case.
///
/// `/cmd@name` is accepted for any bot name; use [`on_command_for`] in chats
/// shared with other bots. Yields `{"command": .., "args": [..]}`.
pub fn on_command<I, S>(names: I) -> HandlerBuilder
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    HandlerBuilder::new("command", commands(names, None))
}

/// Like [`on_command`], but `/cmd@name` only matches when `name` is
/// `bot_username`.
pub fn on_command_for<I, S>(names: I, bot_username: impl AsRef<str>) -> HandlerBuilder
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let username = bot_username.as_ref();
    let username = username.strip_prefix('@').unwrap_or(username).to_lowercase();
    HandlerBuilder::new("command", commands(names, Some(username)))
}

fn commands<I, S>(names: I, bot_username: Option<String>) -> BoxedFilter
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let names: HashSet<String> = names
        .into_iter()
        .map(|n| n.as_ref().trim_start_matches('/').to_lowercase())
        .collect();
    let label = format!("commands({})", sorted(&names).join(","));
    data_filter_fn(label, move |u| {
        let message = u.message().or_else(|| u.edited_message())?;
        let cmd = message.command()?;
        let name = cmd.name.to_lowercase();
        if !names.contains(&name) {
            return None;
        }
        if let (Some(mention), Some(expected)) = (cmd.mention, bot_username.as_deref())
            && !mention.eq_ignore_ascii_case(expected)
        {
            return None;
        }
        let mut data = MatchData::new();
        data.insert("command".to_string(), json!(name));
        data.insert("args".to_string(), json!(cmd.arg_list()));
        Some(data)
    })
}

fn sorted(names: &HashSet<String>) -> Vec<&str> {
    let mut list: Vec<&str> = names.iter().map(String::as_str).collect();
    list.sort_unstable();
    list
}

// ============================================================================
// Callback queries
// ============================================================================

type DataPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Which callback-query payloads a handler accepts.
#[derive(Clone, Default)]
pub enum CallbackPattern {
    /// Every callback query, with or without data.
    #[default]
    Any,
    /// Data equal to the given string.
    Exact(String),
    /// Data starting with the given string. Yields `"rest"` as well.
    Prefix(String),
    /// Data accepted by a predicate.
    Predicate(DataPredicate),
}

impl CallbackPattern {
    pub fn exact(data: impl Into<String>) -> Self {
        Self::Exact(data.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    fn extract(&self, data: Option<&str>) -> Option<MatchData> {
        let mut out = MatchData::new();
        if let Some(data) = data {
            out.insert("data".to_string(), Value::from(data));
        }
        let accepted = match self {
            Self::Any => true,
            Self::Exact(expected) => data == Some(expected.as_str()),
            Self::Prefix(prefix) => match data.and_then(|d| d.strip_prefix(prefix.as_str())) {
                Some(rest) => {
                    out.insert("rest".to_string(), Value::from(rest));
                    true
                }
                None => false,
            },
            Self::Predicate(f) => data.is_some_and(|d| f(d)),
        };
        accepted.then_some(out)
    }
}

impl fmt::Debug for CallbackPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("Any"),
            Self::Exact(s) => f.debug_tuple("Exact").field(s).finish(),
            Self::Prefix(s) => f.debug_tuple("Prefix").field(s).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Callback queries whose data fits `pattern`. Yields `{"data": ..}`.
pub fn on_callback_query(pattern: CallbackPattern) -> HandlerBuilder {
    let label = format!("callback_query({pattern:?})");
    let filter = data_filter_fn(label, move |u| {
        let query = u.callback_query()?;
        pattern.extract(query.data.as_deref())
    });
    HandlerBuilder::new("callback_query", filter)
}

/// Inline queries.
pub fn on_inline_query() -> HandlerBuilder {
    HandlerBuilder::new("inline_query", filter::update_type(UpdateType::InlineQuery))
}

// ============================================================================
// Chat join requests and membership
// ============================================================================

/// Builder for chat join request handlers with an optional allow-list.
#[must_use = "call `.callback()` to finish the handler"]
#[derive(Debug, Default)]
pub struct JoinRequestBuilder {
    chat_ids: Vec<i64>,
    usernames: Vec<String>,
}

impl JoinRequestBuilder {
    /// Accepts requests to these chat ids.
    pub fn chat_ids(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.chat_ids.extend(ids);
        self
    }

    /// Accepts requests from users with these usernames. A leading `@` is
    /// ignored; the comparison is exact.
    pub fn usernames<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.usernames.extend(names.into_iter().map(Into::into));
        self
    }

    /// Finishes the allow-list. An empty allow-list accepts every request.
    pub fn into_builder(self) -> HandlerBuilder {
        HandlerBuilder::new(
            "chat_join_request",
            filter::join_request(self.chat_ids, self.usernames),
        )
    }

    /// Finishes the handler with its callback.
    pub fn callback<F, T>(self, callback: F) -> crate::handler::Handler
    where
        F: crate::handler::Callback<T>,
        T: 'static,
    {
        self.into_builder().callback(callback)
    }
}

/// Chat join requests, optionally restricted to some chats or users.
pub fn on_chat_join_request() -> JoinRequestBuilder {
    JoinRequestBuilder::default()
}

/// Which member updates a [`on_chat_member`] handler receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatMemberScope {
    /// Changes to the bot's own membership.
    #[default]
    My,
    /// Changes to other members.
    Chat,
    /// Both.
    Any,
}

/// Chat member updates of the given scope.
pub fn on_chat_member(scope: ChatMemberScope) -> HandlerBuilder {
    let filter = match scope {
        ChatMemberScope::My => filter::update_type(UpdateType::MyChatMember),
        ChatMemberScope::Chat => filter::update_type(UpdateType::ChatMember),
        ChatMemberScope::Any => {
            filter::update_types([UpdateType::MyChatMember, UpdateType::ChatMember])
        }
    };
    HandlerBuilder::new("chat_member", filter)
}
