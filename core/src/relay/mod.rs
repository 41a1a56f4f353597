//! Rendezvous layer: the relay server and the discovery client.
//!
//! The relay assigns ephemeral session IDs, answers discovery queries, and
//! forwards negotiation traffic between sessions. It never carries file
//! bytes; those move over the direct channel once negotiated.

pub mod client;
pub mod protocol;
pub mod server;
pub mod socks;

pub use client::{RelayClient, RelayClientConfig, RelayClientError, RelayEvent};
pub use protocol::{
    ClientMessage, Descriptor, ForwardPayload, ServerMessage, SessionId, TransferMetadata,
};
pub use server::{RelayServer, RelayServerConfig, RelayServerError, RelayServerStats};
