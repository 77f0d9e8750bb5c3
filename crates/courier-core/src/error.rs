//! Error types for calls made through a [`Bot`](crate::Bot).

use thiserror::Error;

/// Errors returned by bot API calls.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The bot has no working connection to the platform.
    #[error("bot is not connected")]
    NotConnected,

    /// The call did not complete in time.
    #[error("API call timed out")]
    Timeout,

    /// The platform answered with an error description.
    #[error("API error ({code}): {description}")]
    Platform {
        /// Platform error code.
        code: i32,
        /// Human-readable description returned by the platform.
        description: String,
    },

    /// Request or response could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Creates a platform error.
    pub fn platform(code: i32, description: impl Into<String>) -> Self {
        Self::Platform {
            code,
            description: description.into(),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for API calls.
pub type ApiResult<T> = Result<T, ApiError>;
