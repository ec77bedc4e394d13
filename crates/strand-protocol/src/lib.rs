//! # strand-protocol
//!
//! Wire protocol for the strand realtime hub.
//!
//! This crate defines the closed set of hub messages exchanged between
//! clients and servers, the pre-protocol handshake and negotiate shapes, and
//! two interchangeable codecs:
//!
//! - **JSON** — UTF-8 JSON frames terminated by the record separator `0x1E`
//! - **MessagePack** — positional arrays behind a 7-bit varint length prefix
//!
//! ## Example
//!
//! ```rust
//! use strand_protocol::{json, Message};
//! use serde_json::json;
//!
//! let message = Message::invocation("1", "echo", vec![json!("hi")]);
//! let encoded = json::encode(&message).unwrap();
//! let decoded = json::decode(&encoded).unwrap();
//! assert_eq!(message, decoded);
//! ```

pub mod error;
pub mod json;
pub mod messagepack;
pub mod messages;
pub mod protocol;

pub use error::{ProtocolError, MAX_FRAME_SIZE};
pub use messages::{
    AvailableTransport, HandshakeRequest, HandshakeResponse, Message, MessageKind,
    NegotiateResponse,
};
pub use protocol::{
    protocol_by_name, HubProtocol, JsonProtocol, MessagePackProtocol, TransferFormat,
    HANDSHAKE_VERSION,
};
