//! # strand-core
//!
//! Hub dispatch, the per-connection invocation loop, and the client-group
//! registry for the strand realtime hub.
//!
//! This crate provides the building blocks between transports and
//! application hubs:
//!
//! - **Hub** - methods registered once, dispatched case-insensitively
//! - **HubEngine** - drives each connection from handshake to teardown
//! - **ClientRegistry** - live connections and group membership
//! - **HubContext** - the client API available inside hub method bodies
//! - **UploadStream / ServerStream** - client-to-server and
//!   server-to-client streams
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐      ┌───────────┐      ┌──────────────┐
//! │ Transport │─────▶│ HubEngine │─────▶│  Hub method  │
//! └───────────┘      └───────────┘      └──────────────┘
//!                          │                    │
//!                          ▼                    ▼
//!                 ┌────────────────┐     ┌────────────┐
//!                 │ ClientRegistry │◀────│ HubContext │
//!                 └────────────────┘     └────────────┘
//! ```

pub mod connection;
pub mod context;
pub mod error;
pub mod handler;
pub mod hub;
pub mod invocation;
pub mod options;
pub mod registry;
pub mod streams;

pub use connection::ConnectionHandle;
pub use context::{ClientProxy, Clients, Groups, HubContext};
pub use error::{ConnectionError, DispatchError, HubError, InvokeError};
pub use hub::{Hub, HubBuilder, HubSource, InvocationOutput, InvocationRequest, ResultKind};
pub use invocation::HubEngine;
pub use options::{HubOptions, OverflowPolicy};
pub use registry::{ClientRegistry, RegistryError};
pub use streams::{ServerStream, UploadStream, ValueStream};
