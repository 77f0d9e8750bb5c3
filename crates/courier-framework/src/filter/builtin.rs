//! Built-in filters.
//!
//! Message-content filters look at [`Update::effective_message`], so they
//! also apply to edited messages, channel posts and the message a callback
//! query button belongs to.

use std::collections::HashSet;

use serde_json::{Value, json};

use courier_core::{ChatType, Update, UpdateType};

use super::{BoxedFilter, MatchData, data_filter_fn, filter_fn};

/// Matches every update.
pub fn all() -> BoxedFilter {
    filter_fn("all", |_| true)
}

/// Messages with text, commands included.
pub fn text() -> BoxedFilter {
    filter_fn("text", |u| {
        u.effective_message().is_some_and(|m| m.text.is_some())
    })
}

/// Messages whose text is exactly `expected`.
pub fn text_equals(expected: impl Into<String>) -> BoxedFilter {
    let expected = expected.into();
    filter_fn(format!("text_equals({expected})"), move |u| {
        u.effective_message().and_then(|m| m.text()) == Some(expected.as_str())
    })
}

/// Messages whose text contains `needle`.
pub fn text_contains(needle: impl Into<String>) -> BoxedFilter {
    let needle = needle.into();
    filter_fn(format!("text_contains({needle})"), move |u| {
        u.effective_message()
            .and_then(|m| m.text())
            .is_some_and(|t| t.contains(needle.as_str()))
    })
}

/// Messages whose text starts with `prefix`.
///
/// Yields `{"rest": <text after the prefix>}`.
pub fn text_starts_with(prefix: impl Into<String>) -> BoxedFilter {
    let prefix = prefix.into();
    data_filter_fn(format!("text_starts_with({prefix})"), move |u| {
        let rest = u.effective_message()?.text()?.strip_prefix(prefix.as_str())?;
        let mut data = MatchData::new();
        data.insert("rest".to_string(), Value::from(rest.trim_start()));
        Some(data)
    })
}

/// Messages with a media caption.
pub fn caption() -> BoxedFilter {
    filter_fn("caption", |u| {
        u.effective_message().is_some_and(|m| m.caption.is_some())
    })
}

/// Messages that start with any bot command.
pub fn command() -> BoxedFilter {
    filter_fn("command", |u| {
        u.effective_message().is_some_and(|m| m.command().is_some())
    })
}

/// Messages invoking the command `name` (case-insensitive, no slash).
///
/// Yields `{"command": name, "args": [..]}`.
pub fn is_command(name: impl Into<String>) -> BoxedFilter {
    let name = name.into();
    data_filter_fn(format!("is_command({name})"), move |u| {
        let cmd = u.effective_message()?.command()?;
        if !cmd.name.eq_ignore_ascii_case(&name) {
            return None;
        }
        let mut data = MatchData::new();
        data.insert("command".to_string(), json!(cmd.name.to_lowercase()));
        data.insert("args".to_string(), json!(cmd.arg_list()));
        Some(data)
    })
}

/// Messages that reply to another message.
pub fn reply() -> BoxedFilter {
    filter_fn("reply", |u| {
        u.effective_message()
            .is_some_and(|m| m.reply_to_message.is_some())
    })
}

/// Updates whose effective chat is of the given kind.
pub fn chat_type(kind: ChatType) -> BoxedFilter {
    filter_fn(format!("chat_type({})", kind.as_str()), move |u| {
        u.effective_chat().is_some_and(|c| c.kind == kind)
    })
}

/// Updates from private chats.
pub fn private_chats() -> BoxedFilter {
    chat_type(ChatType::Private)
}

/// Updates from groups and supergroups.
pub fn group_chats() -> BoxedFilter {
    filter_fn("group_chats", |u| {
        u.effective_chat()
            .is_some_and(|c| matches!(c.kind, ChatType::Group | ChatType::Supergroup))
    })
}

/// Updates whose effective chat id is in `ids`.
pub fn chat_ids(ids: impl IntoIterator<Item = i64>) -> BoxedFilter {
    let ids: HashSet<i64> = ids.into_iter().collect();
    filter_fn("chat_ids", move |u| {
        u.effective_chat().is_some_and(|c| ids.contains(&c.id))
    })
}

/// Updates whose effective user id is in `ids`.
pub fn user_ids(ids: impl IntoIterator<Item = i64>) -> BoxedFilter {
    let ids: HashSet<i64> = ids.into_iter().collect();
    filter_fn("user_ids", move |u| {
        u.effective_user().is_some_and(|user| ids.contains(&user.id))
    })
}

/// Updates whose effective user has one of `names`.
///
/// A leading `@` is ignored and comparison is case-insensitive.
pub fn usernames<I, S>(names: I) -> BoxedFilter
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let names = normalize_usernames(names);
    filter_fn("usernames", move |u| {
        u.effective_user()
            .and_then(|user| user.username.as_deref())
            .is_some_and(|name| names.contains(&name.to_lowercase()))
    })
}

/// Updates whose user's client language starts with `prefix` (e.g. `"en"`).
pub fn language(prefix: impl Into<String>) -> BoxedFilter {
    let prefix = prefix.into();
    filter_fn(format!("language({prefix})"), move |u| {
        u.effective_user()
            .and_then(|user| user.language_code.as_deref())
            .is_some_and(|code| code.starts_with(prefix.as_str()))
    })
}

/// Updates of exactly one type.
pub fn update_type(kind: UpdateType) -> BoxedFilter {
    filter_fn(format!("update_type({kind})"), move |u| u.update_type() == kind)
}

/// Updates of any of the given types.
pub fn update_types(kinds: impl IntoIterator<Item = UpdateType>) -> BoxedFilter {
    let kinds: HashSet<UpdateType> = kinds.into_iter().collect();
    filter_fn("update_types", move |u| kinds.contains(&u.update_type()))
}

/// Chat join requests for the given chats or from the given users.
///
/// A request matches when its chat id is in `chat_ids` or the requesting
/// user's username is in `usernames`. A leading `@` is ignored; usernames
/// are compared exactly. With both lists empty every join request matches.
/// Other update kinds never match.
pub fn join_request<I, S>(chat_ids: impl IntoIterator<Item = i64>, usernames: I) -> BoxedFilter
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let ids: HashSet<i64> = chat_ids.into_iter().collect();
    let names: HashSet<String> = usernames
        .into_iter()
        .map(|n| strip_at(n.as_ref()).to_string())
        .collect();
    filter_fn("join_request", move |u| {
        let Some(request) = u.chat_join_request() else {
            return false;
        };
        if ids.is_empty() && names.is_empty() {
            return true;
        }
        if ids.contains(&request.chat.id) {
            return true;
        }
        request
            .from
            .username
            .as_deref()
            .is_some_and(|name| names.contains(name))
    })
}

fn strip_at(name: &str) -> &str {
    name.strip_prefix('@').unwrap_or(name)
}

fn normalize_usernames<I, S>(names: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|n| strip_at(n.as_ref()).to_lowercase())
        .collect()
}
