//! Protocol error type shared by both codecs.

use thiserror::Error;

/// Maximum encoded frame size (16 MiB). Application-level message limits are
/// enforced separately by the server configuration.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur while encoding or decoding protocol frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// The wire `type` discriminator is outside the known set.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// A field required by the message type is absent.
    #[error("message type {kind} is missing required field `{field}`")]
    MissingField { kind: u8, field: &'static str },

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack decoding error.
    #[error("messagepack decode error: {0}")]
    MsgPackDecode(#[from] rmpv::decode::Error),

    /// MessagePack encoding error.
    #[error("messagepack encode error: {0}")]
    MsgPackEncode(#[from] rmpv::encode::Error),

    /// The varint length prefix is malformed (more than five bytes).
    #[error("malformed varint length prefix")]
    BadLengthPrefix,

    /// Anything else that makes a frame undecodable.
    #[error("invalid frame: {0}")]
    Invalid(String),
}
