//! Runtime error types.

use thiserror::Error;

use courier_core::{ApiError, Update};
use courier_framework::RegistrationError;

use crate::config::ConfigError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Bot API error: {0}")]
    Api(#[from] ApiError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// The operation needs a bot and none was configured.
    #[error("No bot configured")]
    NoBot,

    /// The update loop already ran; an application runs once.
    #[error("Application is already running or has been stopped")]
    AlreadyRunning,
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Why an update was not accepted by an [`UpdateIntake`](crate::UpdateIntake).
///
/// The rejected update is handed back.
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("update queue is full")]
    Full(Box<Update>),

    #[error("update loop has stopped")]
    Closed(Box<Update>),
}

impl IntakeError {
    /// The update that was not accepted.
    pub fn into_update(self) -> Update {
        match self {
            Self::Full(update) | Self::Closed(update) => *update,
        }
    }
}
