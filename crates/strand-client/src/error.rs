//! Client-side error type.

use thiserror::Error;

use strand_protocol::ProtocolError;
use strand_transport::TransportError;

/// How a client operation can fail.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The negotiate request failed.
    #[error("negotiate failed: {0}")]
    Negotiate(#[from] reqwest::Error),

    /// The hub URL is not parseable.
    #[error("invalid hub url: {0}")]
    Url(#[from] url::ParseError),

    /// The requested protocol is not one this client speaks.
    #[error("unsupported protocol '{0}'")]
    UnsupportedProtocol(String),

    /// The server rejected the protocol handshake.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame failed to decode.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No session is established.
    #[error("not connected")]
    NotConnected,

    /// The peer answered an invocation with an error completion.
    #[error("{0}")]
    Hub(String),

    /// The session ended before the invocation completed.
    #[error("invocation canceled")]
    Canceled,

    /// An invocation result did not decode into the requested type.
    #[error("could not decode result: {0}")]
    Decode(#[from] serde_json::Error),
}
