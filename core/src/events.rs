//! The fixed set of events a node emits.
//!
//! Consumers (CLI, GUI shell, tests) receive these over a single channel;
//! there is no other way state changes leave the node.

use crate::relay::SessionId;
use crate::transfer::Direction;
use std::path::PathBuf;

/// Events emitted by a running node
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The full current peer set, replaced wholesale on each discovery
    PeersUpdated(Vec<SessionId>),
    /// A peer disconnected from the relay
    PeerDisconnected(SessionId),
    /// An incoming transfer awaits a local accept/reject decision.
    ///
    /// Exactly one of `accept`/`reject` is expected; the node never times
    /// this out on its own; only the sender's wait is bounded.
    TransferRequestReceived {
        peer: SessionId,
        name: String,
        size: u64,
    },
    /// Bytes moved in either direction
    TransferProgress {
        peer: SessionId,
        direction: Direction,
        name: String,
        bytes_transferred: u64,
        total_bytes: u64,
        /// 0.0 ..= 100.0
        percent: f64,
        /// Instantaneous throughput in bytes/sec, when measurable
        throughput: Option<f64>,
    },
    /// A transfer finished and verified
    TransferCompleted {
        peer: SessionId,
        direction: Direction,
        name: String,
        size: u64,
        /// Destination path for incoming transfers
        path: Option<PathBuf>,
    },
    /// The recipient declined, or we declined an incoming request
    TransferRejected { peer: SessionId, name: String },
    /// A transfer ended in error; `reason` is human-readable
    TransferFailed {
        peer: SessionId,
        name: String,
        reason: String,
    },
    /// A direct channel opened to the peer
    ChannelOpen(SessionId),
    /// Negotiation with the peer failed; other peers are unaffected
    ConnectionFailed { peer: SessionId, reason: String },
    /// Our own relay connection is gone; discovery and new requests stop,
    /// in-flight direct transfers continue
    RelayDisconnected,
}
