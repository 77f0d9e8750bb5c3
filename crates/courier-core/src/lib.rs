//! # Courier Core
//!
//! Data model shared by every Courier crate.
//!
//! - **Updates**: the [`Update`] envelope and its tagged [`UpdateKind`] payload,
//!   with capability accessors used by routing code
//! - **Platform types**: the routing-relevant subset of users, chats, messages,
//!   callback queries, join requests and membership changes
//! - **Bot**: the outbound [`Bot`] collaborator that callbacks use to talk back
//!   to the platform
//!
//! Nothing in this crate knows about handlers or dispatch; see
//! `courier-framework` for that.

pub mod bot;
pub mod error;
pub mod types;
pub mod update;

pub use bot::{Bot, BoxedBot, downcast_bot};
pub use error::{ApiError, ApiResult};
pub use types::{
    BotCommand, CallbackQuery, Chat, ChatJoinRequest, ChatMember, ChatMemberStatus,
    ChatMemberUpdated, ChatType, InlineQuery, Message, MessageEntity, User,
};
pub use update::{Update, UpdateKind, UpdateType};
