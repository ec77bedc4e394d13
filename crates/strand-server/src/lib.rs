//! # strand-server
//!
//! HTTP surface and configuration for the strand realtime hub: the
//! negotiate endpoint, the WebSocket upgrade, the SSE stream/POST pair, the
//! Prometheus exporter, and the message-bus hub the binary serves.

pub mod bus;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod negotiate;

pub use config::Config;
pub use handlers::{hub_router, run_server, AppState};
