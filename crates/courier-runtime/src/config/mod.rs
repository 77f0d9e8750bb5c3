//! Configuration for the Courier runtime.
//!
//! Settings are layered with figment: built-in defaults, then config files,
//! then `COURIER_*` environment variables. See [`loader`] for the details.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    CourierConfig, IntakeConfig, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig,
    PollingConfig, SpanEventConfig,
};
pub use validation::validate_config;
