//! Error types for the cloud session layer.

use thiserror::Error;

use crate::session;

/// Result type alias for cloud session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the codec, the connection and the client.
#[derive(Error, Debug)]
pub enum Error {
    /// A property name, timestamp or other argument was rejected before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No connection strategy matches the supplied options.
    #[error("connection failed: options not valid")]
    InvalidOptions,

    /// `connect` was called on a client that already holds a connection.
    #[error("connection failed: connection already open")]
    ConnectionAlreadyOpen,

    /// An operation needed a live transport handle and there is none.
    #[error("no connection found")]
    NoConnection,

    /// The transport handshake did not complete.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The cloud did not announce a thing for the device in time.
    #[error("no thing associated with device {device_id}")]
    NoThingAssociated {
        /// The device that was waiting for its thing
        device_id: String,
    },

    /// The token exchange endpoint answered with a non-success status.
    #[error("token exchange failed with status {status}: {body}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body as text
        body: String,
    },

    /// The HTTP request itself failed.
    #[error(transparent)]
    Request(#[from] reqwest::Error),

    /// A bearer token could not be parsed.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Token rotation was abandoned because the client disconnected.
    #[error("token rotation cancelled")]
    Cancelled,

    /// Token rotation was requested on a device-credential session.
    #[error("token rotation requires a token-authenticated session")]
    TokenRotationUnsupported,

    /// A property batch could not be serialized.
    #[error("failed to encode property batch: {0}")]
    Encode(String),

    /// A frame could not be decoded as a property batch.
    #[error("failed to decode property batch: {0}")]
    Decode(String),

    /// A request on the live MQTT session failed.
    #[error("{operation} failed: {source}")]
    Transport {
        /// The operation that failed
        operation: &'static str,
        /// The underlying session error
        source: session::RequestError,
    },
}

impl Error {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn transport(operation: &'static str) -> impl FnOnce(session::RequestError) -> Self {
        move |source| Self::Transport { operation, source }
    }
}
