//! Error types for the bus client
//!
//! Public bus operations never return these: failures are logged where they
//! happen. They surface from constructors, configuration loading, parsing and
//! the collaborator traits.

use thiserror::Error;

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the bus client
#[derive(Error, Debug)]
pub enum Error {
    /// Broker transport errors (connect, subscribe, send, ...)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A topic that does not follow the bus layout
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// An inbound payload that cannot be decoded
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A module hook returned an error
    #[error("runtime error during {hook}(): {message}")]
    Hook {
        /// Hook name
        hook: &'static str,
        /// Error message
        message: String,
    },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an invalid topic error
    pub fn invalid_topic(msg: impl Into<String>) -> Self {
        Self::InvalidTopic(msg.into())
    }

    /// Create an invalid message error
    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a hook error
    pub fn hook(hook: &'static str, message: impl Into<String>) -> Self {
        Self::Hook {
            hook,
            message: message.into(),
        }
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
