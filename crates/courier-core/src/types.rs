//! Platform data objects relevant to routing.
//!
//! Only the fields that filters, handlers and conversation keying look at are
//! modelled here. Unknown fields in incoming JSON are ignored.

use serde::{Deserialize, Serialize};

// =============================================================================
// Users and chats
// =============================================================================

/// A platform user or bot account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
}

impl User {
    /// Creates a user with only the mandatory fields set.
    pub fn new(id: i64, first_name: impl Into<String>) -> Self {
        Self {
            id,
            is_bot: false,
            first_name: first_name.into(),
            last_name: None,
            username: None,
            language_code: None,
        }
    }

    /// Sets the username (without a leading `@`).
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the IETF language tag of the user's client.
    pub fn with_language(mut self, code: impl Into<String>) -> Self {
        self.language_code = Some(code.into());
        self
    }

    /// First and last name joined by a space.
    pub fn full_name(&self) -> String {
        match &self.last_name {
            Some(last) => format!("{} {last}", self.first_name),
            None => self.first_name.clone(),
        }
    }
}

/// The kind of chat a message was sent in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatType {
    /// Returns the wire name of this chat type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
            Self::Supergroup => "supergroup",
            Self::Channel => "channel",
        }
    }
}

/// A chat: private conversation, group, supergroup or channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Chat {
    /// Creates a chat of the given kind.
    pub fn new(id: i64, kind: ChatType) -> Self {
        Self {
            id,
            kind,
            title: None,
            username: None,
        }
    }

    /// Shorthand for a private chat.
    pub fn private(id: i64) -> Self {
        Self::new(id, ChatType::Private)
    }

    /// Shorthand for a group chat with a title.
    pub fn group(id: i64, title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::new(id, ChatType::Group)
        }
    }

    /// Sets the public username of the chat (without a leading `@`).
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

// =============================================================================
// Messages
// =============================================================================

/// A special entity inside message text (command, mention, url, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
}

impl MessageEntity {
    /// A `bot_command` entity spanning `length` units from `offset`.
    pub fn bot_command(offset: usize, length: usize) -> Self {
        Self {
            kind: "bot_command".to_string(),
            offset,
            length,
        }
    }
}

/// A message, edited message or channel post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub date: i64,
    pub chat: Chat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<MessageEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message: Option<Box<Message>>,
}

/// A parsed `/command@bot args` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BotCommand<'a> {
    /// Command name without the leading slash.
    pub name: &'a str,
    /// The `@bot` suffix, if present.
    pub mention: Option<&'a str>,
    /// Everything after the command, trimmed.
    pub args: &'a str,
}

impl BotCommand<'_> {
    /// Whitespace-separated arguments.
    pub fn arg_list(&self) -> Vec<String> {
        self.args.split_whitespace().map(str::to_string).collect()
    }
}

impl Message {
    /// Creates an empty message in `chat`.
    pub fn new(message_id: i64, chat: Chat) -> Self {
        Self {
            message_id,
            date: 0,
            chat,
            from: None,
            text: None,
            caption: None,
            entities: Vec::new(),
            reply_to_message: None,
        }
    }

    /// Sets the sender.
    pub fn with_from(mut self, user: User) -> Self {
        self.from = Some(user);
        self
    }

    /// Sets the text. A leading `/word` is tagged with a `bot_command` entity.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if text.starts_with('/') {
            let len = text.find(char::is_whitespace).unwrap_or(text.len());
            self.entities = vec![MessageEntity::bot_command(0, len)];
        }
        self.text = Some(text);
        self
    }

    /// Sets the media caption.
    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    /// Marks this message as a reply to `original`.
    pub fn replying_to(mut self, original: Message) -> Self {
        self.reply_to_message = Some(Box::new(original));
        self
    }

    /// The message text, if any.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Parses a leading bot command.
    ///
    /// A message carries a command when its first entity is a `bot_command` at
    /// offset 0. Messages without any entities fall back to a leading `/`.
    pub fn command(&self) -> Option<BotCommand<'_>> {
        let text = self.text.as_deref()?;
        let tagged = self
            .entities
            .iter()
            .any(|e| e.kind == "bot_command" && e.offset == 0);
        if !tagged && !(self.entities.is_empty() && text.starts_with('/')) {
            return None;
        }

        let rest = text.strip_prefix('/')?;
        let (head, args) = match rest.split_once(char::is_whitespace) {
            Some((head, args)) => (head, args.trim()),
            None => (rest, ""),
        };
        if head.is_empty() {
            return None;
        }

        let (name, mention) = match head.split_once('@') {
            Some((name, mention)) => (name, Some(mention)),
            None => (head, None),
        };
        Some(BotCommand {
            name,
            mention,
            args,
        })
    }
}

// =============================================================================
// Other payloads
// =============================================================================

/// A button press on an inline keyboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Box<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_message_id: Option<String>,
    #[serde(default)]
    pub chat_instance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// An inline query typed into the message field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub offset: String,
}

/// A request to join a chat that requires admin approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatJoinRequest {
    pub chat: Chat,
    pub from: User,
    #[serde(default)]
    pub user_chat_id: i64,
    #[serde(default)]
    pub date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

/// Membership status of a user in a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMemberStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
}

/// A user's membership record in a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMember {
    pub user: User,
    pub status: ChatMemberStatus,
}

/// A change in a chat member's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMemberUpdated {
    pub chat: Chat,
    pub from: User,
    #[serde(default)]
    pub date: i64,
    pub old_chat_member: ChatMember,
    pub new_chat_member: ChatMember,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_message(text: &str) -> Message {
        Message::new(1, Chat::private(10)).with_text(text)
    }

    #[test]
    fn test_command_parsing() {
        let msg = text_message("/start@my_bot  hello  world ");
        let cmd = msg.command().unwrap();
        assert_eq!(cmd.name, "start");
        assert_eq!(cmd.mention, Some("my_bot"));
        assert_eq!(cmd.args, "hello  world");
        assert_eq!(cmd.arg_list(), vec!["hello", "world"]);
    }

    #[test]
    fn test_plain_text_is_not_command() {
        assert!(text_message("hello /start").command().is_none());
        assert!(text_message("/").command().is_none());
    }

    #[test]
    fn test_command_requires_leading_entity() {
        let mut msg = text_message("/start");
        msg.entities = vec![MessageEntity {
            kind: "bold".to_string(),
            offset: 0,
            length: 6,
        }];
        assert!(msg.command().is_none());
    }

    #[test]
    fn test_chat_type_wire_name() {
        let chat: Chat = serde_json::from_str(r#"{"id": 5, "type": "supergroup"}"#).unwrap();
        assert_eq!(chat.kind, ChatType::Supergroup);
        assert_eq!(chat.kind.as_str(), "supergroup");
    }
}
