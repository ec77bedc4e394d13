//! The [`HubProtocol`] seam between transports and the invocation loop.
//!
//! A protocol pairs a serialization with a framing; both sides of a
//! connection agree on one during the handshake and keep it for the
//! connection's lifetime.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::messages::Message;
use crate::{json, messagepack};

/// Whether frames travel as text or binary transport messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferFormat {
    Text,
    Binary,
}

impl TransferFormat {
    /// The name used in negotiate responses.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferFormat::Text => "Text",
            TransferFormat::Binary => "Binary",
        }
    }
}

/// A protocol message codec usable by any transport.
pub trait HubProtocol: Send + Sync {
    /// Wire name advertised in handshakes (`"json"`, `"messagepack"`).
    fn name(&self) -> &'static str;

    /// Preferred transfer format for this protocol's frames.
    fn transfer_format(&self) -> TransferFormat;

    /// Encode one message as a complete frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the frame is too large.
    fn encode(&self, message: &Message) -> Result<Bytes, ProtocolError>;

    /// Try to decode one message from buffered bytes, consuming the frame on
    /// success. `Ok(None)` means more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed frames.
    fn decode(&self, buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError>;
}

/// JSON frames terminated by `0x1E`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonProtocol;

impl HubProtocol for JsonProtocol {
    fn name(&self) -> &'static str {
        "json"
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn encode(&self, message: &Message) -> Result<Bytes, ProtocolError> {
        json::encode(message)
    }

    fn decode(&self, buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        json::decode_from(buf)
    }
}

/// MessagePack frames behind a varint length prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessagePackProtocol;

impl HubProtocol for MessagePackProtocol {
    fn name(&self) -> &'static str {
        "messagepack"
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Binary
    }

    fn encode(&self, message: &Message) -> Result<Bytes, ProtocolError> {
        messagepack::encode(message)
    }

    fn decode(&self, buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        messagepack::decode_from(buf)
    }
}

/// Look up a protocol by its handshake name.
#[must_use]
pub fn protocol_by_name(name: &str) -> Option<Arc<dyn HubProtocol>> {
    match name {
        "json" => Some(Arc::new(JsonProtocol)),
        "messagepack" => Some(Arc::new(MessagePackProtocol)),
        _ => None,
    }
}

/// The handshake version both peers must speak.
pub const HANDSHAKE_VERSION: u32 = 1;
