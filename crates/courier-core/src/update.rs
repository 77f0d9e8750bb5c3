//! The inbound update envelope.
//!
//! An [`Update`] wraps exactly one payload, tagged by its kind. Routing code
//! never matches on raw JSON; it asks the update for a capability through an
//! accessor such as [`Update::message`] or [`Update::effective_chat`], each
//! returning `None` when the update does not carry that payload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{
    CallbackQuery, Chat, ChatJoinRequest, ChatMemberUpdated, InlineQuery, Message, User,
};

/// One inbound event from the messaging platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Monotonically increasing identifier used for polling acknowledgment.
    pub update_id: i64,
    /// The payload carried by this update.
    #[serde(flatten)]
    pub kind: UpdateKind,
}

/// The payload of an [`Update`], keyed by its wire field name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Message(Message),
    EditedMessage(Message),
    ChannelPost(Message),
    EditedChannelPost(Message),
    CallbackQuery(CallbackQuery),
    InlineQuery(InlineQuery),
    ChatJoinRequest(ChatJoinRequest),
    ChatMember(ChatMemberUpdated),
    MyChatMember(ChatMemberUpdated),
}

/// Payload-free discriminant of [`UpdateKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateType {
    Message,
    EditedMessage,
    ChannelPost,
    EditedChannelPost,
    CallbackQuery,
    InlineQuery,
    ChatJoinRequest,
    ChatMember,
    MyChatMember,
}

impl UpdateType {
    /// All update types, in wire order.
    pub const ALL: [UpdateType; 9] = [
        Self::Message,
        Self::EditedMessage,
        Self::ChannelPost,
        Self::EditedChannelPost,
        Self::CallbackQuery,
        Self::InlineQuery,
        Self::ChatJoinRequest,
        Self::ChatMember,
        Self::MyChatMember,
    ];

    /// Returns the wire field name of this update type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::EditedMessage => "edited_message",
            Self::ChannelPost => "channel_post",
            Self::EditedChannelPost => "edited_channel_post",
            Self::CallbackQuery => "callback_query",
            Self::InlineQuery => "inline_query",
            Self::ChatJoinRequest => "chat_join_request",
            Self::ChatMember => "chat_member",
            Self::MyChatMember => "my_chat_member",
        }
    }

    /// Whether this type carries a [`Message`] payload directly.
    pub fn is_message(&self) -> bool {
        matches!(
            self,
            Self::Message | Self::EditedMessage | Self::ChannelPost | Self::EditedChannelPost
        )
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown update type: {s}"))
    }
}

impl Update {
    /// Creates an update from its parts.
    pub fn new(update_id: i64, kind: UpdateKind) -> Self {
        Self { update_id, kind }
    }

    /// Shorthand for a plain `message` update.
    pub fn message_update(update_id: i64, message: Message) -> Self {
        Self::new(update_id, UpdateKind::Message(message))
    }

    /// Returns the discriminant of this update.
    pub fn update_type(&self) -> UpdateType {
        match &self.kind {
            UpdateKind::Message(_) => UpdateType::Message,
            UpdateKind::EditedMessage(_) => UpdateType::EditedMessage,
            UpdateKind::ChannelPost(_) => UpdateType::ChannelPost,
            UpdateKind::EditedChannelPost(_) => UpdateType::EditedChannelPost,
            UpdateKind::CallbackQuery(_) => UpdateType::CallbackQuery,
            UpdateKind::InlineQuery(_) => UpdateType::InlineQuery,
            UpdateKind::ChatJoinRequest(_) => UpdateType::ChatJoinRequest,
            UpdateKind::ChatMember(_) => UpdateType::ChatMember,
            UpdateKind::MyChatMember(_) => UpdateType::MyChatMember,
        }
    }

    pub fn message(&self) -> Option<&Message> {
        match &self.kind {
            UpdateKind::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn edited_message(&self) -> Option<&Message> {
        match &self.kind {
            UpdateKind::EditedMessage(m) => Some(m),
            _ => None,
        }
    }

    pub fn channel_post(&self) -> Option<&Message> {
        match &self.kind {
            UpdateKind::ChannelPost(m) | UpdateKind::EditedChannelPost(m) => Some(m),
            _ => None,
        }
    }

    pub fn callback_query(&self) -> Option<&CallbackQuery> {
        match &self.kind {
            UpdateKind::CallbackQuery(q) => Some(q),
            _ => None,
        }
    }

    pub fn inline_query(&self) -> Option<&InlineQuery> {
        match &self.kind {
            UpdateKind::InlineQuery(q) => Some(q),
            _ => None,
        }
    }

    pub fn chat_join_request(&self) -> Option<&ChatJoinRequest> {
        match &self.kind {
            UpdateKind::ChatJoinRequest(r) => Some(r),
            _ => None,
        }
    }

    /// Membership change of another user, or of the bot itself.
    pub fn chat_member(&self) -> Option<&ChatMemberUpdated> {
        match &self.kind {
            UpdateKind::ChatMember(m) | UpdateKind::MyChatMember(m) => Some(m),
            _ => None,
        }
    }

    /// The message this update is about, wherever it lives.
    ///
    /// For callback queries this is the message the pressed button was
    /// attached to.
    pub fn effective_message(&self) -> Option<&Message> {
        match &self.kind {
            UpdateKind::Message(m)
            | UpdateKind::EditedMessage(m)
            | UpdateKind::ChannelPost(m)
            | UpdateKind::EditedChannelPost(m) => Some(m),
            UpdateKind::CallbackQuery(q) => q.message.as_deref(),
            _ => None,
        }
    }

    /// The chat this update happened in, if any.
    pub fn effective_chat(&self) -> Option<&Chat> {
        match &self.kind {
            UpdateKind::ChatJoinRequest(r) => Some(&r.chat),
            UpdateKind::ChatMember(m) | UpdateKind::MyChatMember(m) => Some(&m.chat),
            _ => self.effective_message().map(|m| &m.chat),
        }
    }

    /// The user who caused this update, if any.
    ///
    /// Channel posts have no sender user.
    pub fn effective_user(&self) -> Option<&User> {
        match &self.kind {
            UpdateKind::Message(m) | UpdateKind::EditedMessage(m) => m.from.as_ref(),
            UpdateKind::ChannelPost(_) | UpdateKind::EditedChannelPost(_) => None,
            UpdateKind::CallbackQuery(q) => Some(&q.from),
            UpdateKind::InlineQuery(q) => Some(&q.from),
            UpdateKind::ChatJoinRequest(r) => Some(&r.from),
            UpdateKind::ChatMember(m) | UpdateKind::MyChatMember(m) => Some(&m.from),
        }
    }
}
