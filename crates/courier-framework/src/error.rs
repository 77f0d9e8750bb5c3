//! Error types for the Courier framework.
//!
//! Every failure a callback can produce is funnelled into [`DispatchError`]
//! and, wrapped in a [`HandlerFailure`], handed to the dispatcher's error
//! handlers. None of these errors ever escape the dispatch loop.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use courier_core::Update;

use crate::transition::State;

/// Boxed error type accepted from user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A filter predicate failed while evaluating an update.
///
/// The dispatcher treats this as a non-match, logs it and moves on.
#[derive(Debug, Clone, Error)]
#[error("filter '{filter}' failed: {reason}")]
pub struct FilterError {
    /// Name of the failing filter.
    pub filter: String,
    /// What went wrong.
    pub reason: String,
}

impl FilterError {
    /// Creates a filter error.
    pub fn new(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            reason: reason.into(),
        }
    }
}

/// Errors that can occur during context extraction.
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    /// The update does not carry the requested payload.
    #[error("update has no {0}")]
    Missing(&'static str),

    /// No bot was attached to the dispatcher.
    #[error("no bot is attached to this dispatcher")]
    BotUnavailable,

    /// A match-data value had an unexpected shape.
    #[error("match data '{key}' is malformed: {reason}")]
    MalformedMatch {
        /// The offending key.
        key: String,
        /// Why it could not be read.
        reason: String,
    },

    /// Custom extraction error.
    #[error("{0}")]
    Custom(String),
}

impl ExtractError {
    /// Creates a custom extraction error.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

/// Result type for extraction operations.
pub type ExtractResult<T> = Result<T, ExtractError>;

/// A user callback returned an error or panicked.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// The callback returned `Err`.
    #[error("callback failed: {0}")]
    Failed(#[source] BoxError),

    /// The callback panicked; the payload message is preserved.
    #[error("callback panicked: {0}")]
    Panicked(String),
}

impl CallbackError {
    /// Wraps any error returned by a callback.
    pub fn failed(err: impl Into<BoxError>) -> Self {
        Self::Failed(err.into())
    }
}

/// A conversation callback returned a state that was never declared.
///
/// This is fatal to the conversation: its stored state is removed.
#[derive(Debug, Clone, Error)]
#[error("conversation '{conversation}' returned undeclared state '{state}'")]
pub struct TransitionError {
    /// Name of the conversation handler.
    pub conversation: String,
    /// The rejected state.
    pub state: State,
}

/// A conversation store backend failed.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing medium failed.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Records could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Misconfiguration detected when building or registering a handler.
#[derive(Debug, Clone, Error)]
pub enum RegistrationError {
    /// A conversation was built without entry points.
    #[error("conversation '{0}' has no entry points")]
    NoEntryPoints(String),

    /// A conversation disabled both per-chat and per-user keying.
    #[error("conversation '{0}' must be keyed per chat, per user, or both")]
    EmptyKeyScope(String),

    /// Timeout handlers were given but no timeout is configured.
    #[error("conversation '{0}' has timeout handlers but no conversation timeout")]
    TimeoutHandlersWithoutTimeout(String),

    /// A zero-length conversation timeout was configured.
    #[error("conversation '{0}' has a zero timeout")]
    ZeroTimeout(String),

    /// A persistent conversation was registered without any store available.
    #[error("conversation '{0}' is persistent but no conversation store is configured")]
    MissingPersistence(String),

    /// A persistent conversation was registered twice.
    #[error("conversation '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Result type for registration operations.
pub type RegistrationResult<T> = Result<T, RegistrationError>;

/// Any failure raised while a handler processed an update.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Wraps a callback's own error.
    pub fn callback(err: impl Into<BoxError>) -> Self {
        Self::Callback(CallbackError::failed(err))
    }
}

/// Result type for handler invocations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// A failure routed to the error-handler chain.
#[derive(Debug)]
pub struct HandlerFailure {
    /// Name of the handler whose callback failed.
    pub handler: String,
    /// The update being processed.
    pub update: Arc<Update>,
    /// What went wrong.
    pub error: DispatchError,
}

impl HandlerFailure {
    pub fn new(
        handler: impl Into<String>,
        update: Arc<Update>,
        error: DispatchError,
    ) -> Self {
        Self {
            handler: handler.into(),
            update,
            error,
        }
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handler '{}' failed on update {}: {}",
            self.handler, self.update.update_id, self.error
        )
    }
}
