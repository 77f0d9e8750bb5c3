//! Handler system for the Courier framework.
//!
//! - **Callbacks** ([`callback`]) – the [`Callback`] trait that adapts async
//!   functions with parameter injection, similar to Axum's handlers, and the
//!   [`HandlerReturn`] values they may produce
//! - **Handler trait** ([`traits`]) – [`UpdateHandler`], the interface the
//!   dispatcher routes updates to
//! - **Standard handler** ([`builder`]) – [`Handler`], a filter paired with a
//!   callback, and the [`HandlerBuilder`] the routing functions return
//!
//! ```rust,ignore
//! async fn start(msg: Message, bot: BoxedBot) -> anyhow::Result<()> {
//!     bot.send_message(msg.chat.id, "Welcome!").await?;
//!     Ok(())
//! }
//!
//! dispatcher.add_handler(on_command(["start"]).callback(start), 0)?;
//! ```

pub mod builder;
pub mod callback;
pub mod traits;

pub use builder::{Handler, HandlerBuilder};
pub use callback::{BoxedCallback, Callback, HandlerReturn, into_callback, invoke};
pub use traits::{BoxedUpdateHandler, Registration, UpdateHandler};
