//! # strand-client
//!
//! Programmatic client for the strand realtime hub: negotiate over HTTP,
//! attach a WebSocket transport, perform the protocol handshake, then
//! invoke, send, and pull streams — with receiver dispatch for
//! server-initiated invocations and exponential-backoff reconnects.
//!
//! ## Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use strand_client::Client;
//!
//! # async fn run() -> Result<(), strand_client::ClientError> {
//! let client = Client::builder("http://127.0.0.1:8220/hub").build();
//! client.start().await?;
//!
//! let echoed: String = client.invoke("echo", vec![json!("hi")]).await?;
//! assert_eq!(echoed, "hi");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod reconnect;

pub use client::{Client, ClientBuilder};
pub use error::ClientError;
pub use reconnect::ReconnectPolicy;
