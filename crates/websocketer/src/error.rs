//! Error handling for the messaging layer.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// The main result type used throughout the crate.
pub type WsrResult<T> = Result<T, WsrError>;

/// Error type for all messaging operations.
///
/// Every variant maps to a stable wire code (see [`WsrError::code`]); error
/// replies carry that code so the failure kind survives the hop between
/// peers.
#[derive(Error, Debug)]
pub enum WsrError {
    /// A request arrived for an operation name with no registered handlers
    #[error("no listener for '{name}'")]
    NoListener { name: String },

    /// No well-formed reply was produced for a request
    #[error("no reply produced for '{name}'")]
    NoReply { name: String },

    /// A single-use completion was invoked a second time
    #[error("reply already produced")]
    TooManyReply,

    /// The per-call deadline elapsed without a reply
    #[error("timeout reached after {duration:?}")]
    Timeout { duration: Duration },

    /// The transport is not open, the connection was lost, or the endpoint
    /// was destroyed
    #[error("no connection: {message}")]
    NoConnection { message: String },

    /// Unexpected failure inside a handler or collaborator
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// An error reply received from the remote peer, code preserved verbatim
    #[error("{message}")]
    Remote {
        name: String,
        code: String,
        message: String,
        payload: Option<Value>,
    },

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WsrError {
    /// Create a no-listener error for the given operation name.
    pub fn no_listener(name: impl Into<String>) -> Self {
        Self::NoListener { name: name.into() }
    }

    /// Create a no-reply error for the given operation name.
    pub fn no_reply(name: impl Into<String>) -> Self {
        Self::NoReply { name: name.into() }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a no-connection error.
    pub fn no_connection(message: impl Into<String>) -> Self {
        Self::NoConnection {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// The wire code for this error.
    ///
    /// Remote errors keep the code they arrived with; everything the local
    /// side cannot classify falls back to `ERR_WSR_UNKNOWN`.
    pub fn code(&self) -> &str {
        match self {
            Self::NoListener { .. } => "ERR_WSR_NO_LISTENER",
            Self::NoReply { .. } => "ERR_WSR_NO_REPLY",
            Self::TooManyReply => "ERR_WSR_TOO_MANY_REPLY",
            Self::Timeout { .. } => "ERR_WSR_TIMEOUT",
            Self::NoConnection { .. } => "ERR_WSR_NO_CONNECTION",
            Self::Internal { .. } | Self::Serialization(_) => "ERR_WSR_INTERNAL",
            Self::Config { .. } => "ERR_WSR_UNKNOWN",
            Self::Remote { code, .. } => code,
        }
    }

    /// Payload attached to the error, if any.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Remote { payload, .. } => payload.as_ref(),
            _ => None,
        }
    }
}
