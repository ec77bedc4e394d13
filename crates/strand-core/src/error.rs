//! Error taxonomy for the hub core.
//!
//! Per-invocation errors ([`DispatchError`], [`HubError`]) are reported to
//! the peer in a completion and never terminate the connection.
//! Per-connection errors ([`ConnectionError`]) terminate only that
//! connection.

use thiserror::Error;

use strand_protocol::ProtocolError;
use strand_transport::TransportError;

/// An error produced by a hub method body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HubError(pub String);

impl HubError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for HubError {
    fn from(message: &str) -> Self {
        Self(message.to_owned())
    }
}

impl From<String> for HubError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// Why an invocation could not be handed to a hub method. The message is
/// sent verbatim as the completion error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No registered method matches the target.
    #[error("Method not found")]
    MethodNotFound,

    /// The argument count does not match the method's value parameters.
    #[error("invalid argument count for '{target}': expected {expected}, got {got}")]
    BadArity {
        target: String,
        expected: usize,
        got: usize,
    },

    /// The stream id count does not match the method's stream parameters.
    #[error("invalid stream count for '{target}': expected {expected}, got {got}")]
    BadStreamArity {
        target: String,
        expected: usize,
        got: usize,
    },

    /// An argument failed to decode into the declared parameter type.
    #[error("could not decode argument {index} of '{target}': {detail}")]
    Argument {
        target: String,
        index: usize,
        detail: String,
    },

    /// A streaming method was invoked through the wrong invocation type.
    #[error("'{target}' does not return a stream")]
    NotStreaming { target: String },
}

/// Errors that end a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Malformed or unsupported handshake.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Malformed frame or unknown message type after the handshake.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No inbound traffic within the timeout interval.
    #[error("connection timed out")]
    Timeout,

    /// The underlying transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The writer queue is full and the overflow policy rejects the write.
    #[error("writer queue full")]
    Backpressure,

    /// The connection is already closed.
    #[error("connection closed")]
    Closed,
}

/// How a server-originated invoke can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    /// The peer answered with an error completion.
    #[error("{0}")]
    Hub(String),

    /// The connection closed before a completion arrived.
    #[error("invocation canceled")]
    Canceled,

    /// The target connection is gone or its writer queue rejected the frame.
    #[error("connection unreachable")]
    Unreachable,

    /// Invoke was called on a group or broadcast target.
    #[error("invoke requires a single connection target")]
    NotSingle,
}
