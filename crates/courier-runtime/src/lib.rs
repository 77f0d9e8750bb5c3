//! # Courier Runtime
//!
//! Runs a [`Dispatcher`](courier_framework::Dispatcher) as an application:
//!
//! - Configuration loading with figment ([`config`])
//! - Logging setup on `tracing-subscriber` ([`logging`])
//! - The update loop, fed by an [`UpdateIntake`] or an [`UpdateSource`]
//!   such as [`BotPollingSource`] ([`Application`])
//!
//! ```ignore
//! use courier::prelude::*;
//! use courier_runtime::Application;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // courier.toml in the current directory, then COURIER_* variables
//!     let app = Application::builder().bot(my_bot()).build()?;
//!
//!     app.dispatcher().add_handler(on_command(["start"]).callback(start), 0)?;
//!
//!     // Until Ctrl+C
//!     app.run_bot_polling().await?;
//!     Ok(())
//! }
//! ```

pub mod application;
pub mod config;
pub mod error;
pub mod logging;
pub mod source;

pub use application::{Application, ApplicationBuilder, RuntimeStats, UpdateIntake};
pub use config::{ConfigError, ConfigLoader, ConfigResult, CourierConfig};
pub use error::{IntakeError, RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, LoggingError, SpanEvents};
pub use source::{BotPollingSource, UpdateSource};

// Re-export tracing for use by bot crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
