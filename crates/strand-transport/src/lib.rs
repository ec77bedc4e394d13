//! # strand-transport
//!
//! Transport abstraction layer for the strand realtime hub.
//!
//! A transport is a uniform full-duplex byte-message channel:
//!
//! - **WebSocket** — text or binary frames, client side dialed with
//!   tokio-tungstenite, server side pumped from the HTTP upgrade
//! - **Server-Sent Events** — outbound event stream paired with a companion
//!   POST route for inbound frames (text only)
//!
//! Adapters own their I/O tasks and surface three events to the invocation
//! loop: received frame, transport error, peer close.

pub mod sse;
pub mod traits;
pub mod websocket;

pub use traits::{
    transport_channel, TransportBackend, TransportChannel, TransportError, TransportEvent,
    TransportKind,
};
