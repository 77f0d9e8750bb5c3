//! # Courier
//!
//! An async update-dispatch framework for messaging-platform bots.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────┐     group 0: first matching handler ──▶ callback
//! │ Application  │────▶│ Dispatcher │────▶ group 1: first matching handler ──▶ worker pool
//! │ (intake/poll)│     │            │────▶ ...
//! └──────────────┘     └────────────┘
//! ```
//!
//! - **Application**: loads configuration, sets up logging and feeds updates
//!   to the dispatcher, from a push queue or by long polling
//! - **Dispatcher**: offers each update to ordered handler groups; blocking
//!   handlers are awaited, the rest run on a bounded worker pool
//! - **Handlers**: a filter plus an Axum-style async callback
//! - **Conversations**: handlers that keep per-chat/per-user state, with
//!   fallbacks and idle timeouts
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use courier::prelude::*;
//!
//! async fn start(msg: Message, bot: BoxedBot) -> anyhow::Result<State> {
//!     bot.send_message(msg.chat.id, "What's your name?").await?;
//!     Ok(State::new("NAME"))
//! }
//!
//! async fn name(msg: Message, bot: BoxedBot) -> anyhow::Result<Transition> {
//!     bot.send_message(msg.chat.id, &format!("Hi {}!", msg.text().unwrap_or(""))).await?;
//!     Ok(Transition::End)
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = Application::builder().bot(my_bot()).build()?;
//!
//!     let signup = app
//!         .dispatcher()
//!         .conversation("signup")
//!         .entry_point(on_command(["start"]).callback(start))
//!         .state("NAME", [on_message(filter::text()).callback(name)])
//!         .build()?;
//!     app.dispatcher().add_handler(signup, 0)?;
//!
//!     app.run_bot_polling().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config`: TOML configuration files (default)
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log lines

pub use courier_core as core;
pub use courier_framework as framework;
pub use courier_runtime as runtime;

pub use courier_framework::{CallbackContext, Dispatcher, State, Transition};
pub use courier_runtime::{Application, CourierConfig};

/// Everything a bot's setup code usually needs.
///
/// ```rust,ignore
/// use courier::prelude::*;
/// ```
pub mod prelude {
    pub use courier_framework::prelude::*;

    pub use courier_framework::{
        CallbackPattern, ChatMemberScope, ConversationStore, DispatchError, FromContext,
        HandlerFailure, InMemoryStore, JsonFileStore, UpdateHandler,
    };

    pub use courier_runtime::{
        Application, BotPollingSource, CourierConfig, UpdateIntake, UpdateSource,
    };

    pub use courier_runtime::prelude::*;
}
