//! chansock - Channel-multiplexed messaging over a single WebSocket.
//!
//! One physical WebSocket carries any number of logical channels. Both
//! sides exchange JSON envelopes tagged with an event name, an optional
//! channel, and optional correlation ids, so independent conversations
//! share one transport without interfering.
//!
//! # Architecture
//!
//! Each connection is driven by an internal actor that owns the socket
//! and every piece of per-connection state:
//!
//! - **Server** - Channel registry and accept loop; hands out
//!   channel-scoped clients as peers join
//! - **Client** - Connecting endpoint; performs the handshake and adopts
//!   the server-advertised reply timeout
//! - **ChannelClient** - A view onto one connection scoped to one
//!   channel; publish, request/reply, and local event listeners
//! - **Envelope** - The wire format (JSON text frames)
//!
//! # Modules
//!
//! - [`protocol`] - Wire envelope encode/decode and channel normalization
//! - [`ws`] - WebSocket transport wrapper (connect + accept)
//! - [`channel`] - Channel-scoped client handles and reply handles
//! - [`client`] - Connecting endpoint and handshake
//! - [`server`] - Accepting endpoint, registry, join dispatch
//! - [`config`] - Endpoint options and handshake payload
//! - [`handshake`] - Connection lifecycle state machine

// Rust guideline compliant 2026-02

pub mod channel;
pub mod client;
pub mod config;
mod connection;
pub mod handshake;
pub mod protocol;
pub mod server;
pub mod ws;

// Re-export the surface most callers need.
pub use channel::{ChannelClient, ClientError, Reply};
pub use client::{connect, connect_default, Client};
pub use config::{ConnectOptions, ServerOptions};
pub use connection::{EVENT_CLOSE, EVENT_ERROR, EVENT_TIMEOUT};
pub use handshake::HandshakeState;
pub use protocol::{DecodeError, Envelope};
pub use server::{Server, ServerHandle};
