//! Channel transport for the corelink dashboard.
//!
//! Provides:
//! - Client-to-server protocol (`ClientMessage`)
//! - Server WebSocket channels bound to the registry (feature: websocket)
//! - Reconnecting client channel with backoff (feature: client)

pub mod backoff;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "client")]
pub mod client;

pub use backoff::{Backoff, ReconnectPolicy};
#[cfg(feature = "client")]
pub use client::{ChannelClient, ChannelEvent, ClientError};
pub use protocol::ClientMessage;
#[cfg(feature = "websocket")]
pub use websocket::create_ws_router;
