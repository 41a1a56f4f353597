//! Transfer session state

use crate::relay::{SessionId, TransferMetadata};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Instant;

/// Which way the file moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Lifecycle of one transfer.
///
/// `Rejected`, `Errored`, and `Completed` are terminal; everything else can
/// move to `Errored` at any point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Outgoing: request sent (or being prepared), awaiting the response
    Requested,
    /// Incoming: surfaced to the local decision surface
    PendingLocalDecision,
    /// Incoming: accept sent, awaiting file-start on the channel
    Accepted,
    /// Outgoing: accepted, waiting for the direct channel to open
    AwaitingChannel,
    /// Outgoing: file-start sent, waiting for file-ready
    AwaitingReady,
    /// Chunks are moving
    Streaming,
    /// Incoming: all bytes written, hash verification running
    Completing,
    Completed,
    Rejected,
    Errored,
}

impl TransferStatus {
    /// Whether this status ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Rejected | TransferStatus::Errored
        )
    }
}

/// One file transfer between this endpoint and one peer
#[derive(Debug, Clone)]
pub struct TransferSession {
    /// Engine-local identifier; timer and task signals carry it so stale
    /// firings can be recognized and dropped
    pub id: u64,
    pub peer: SessionId,
    pub direction: Direction,
    /// File name; advisory until file-start makes it authoritative
    pub name: String,
    /// Declared size in bytes
    pub size: u64,
    /// Advertised SHA-256 digest, when the sender pre-hashed
    pub hash: Option<String>,
    /// Source modification time, seconds since the Unix epoch
    pub modified: Option<u64>,
    /// Bytes moved so far; never exceeds `size`
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    /// Cause, for `Errored`
    pub error: Option<String>,
    /// Source path (outgoing) or destination path (incoming, once allocated)
    pub path: Option<PathBuf>,
}

/// Everything the engine tracks for one peer.
///
/// At most one non-terminal session at a time; later requests wait in FIFO
/// order and start only when the active one retires.
#[derive(Default)]
pub(crate) struct PeerTransfers {
    pub active: Option<TransferSession>,
    /// Outgoing sends waiting for the active session to retire
    pub queued_out: VecDeque<PathBuf>,
    /// Incoming requests waiting to be surfaced
    pub queued_in: VecDeque<TransferMetadata>,
    /// Set once the transfer-request has actually gone out
    pub response_pending: bool,
    /// Running chunk-send task, when streaming outgoing
    pub send_task: Option<tokio::task::JoinHandle<()>>,
    /// Last progress sample, for instantaneous throughput
    pub last_progress: Option<(Instant, u64)>,
}

impl PeerTransfers {
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queued_out.is_empty() && self.queued_in.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Rejected.is_terminal());
        assert!(TransferStatus::Errored.is_terminal());

        assert!(!TransferStatus::Requested.is_terminal());
        assert!(!TransferStatus::PendingLocalDecision.is_terminal());
        assert!(!TransferStatus::Accepted.is_terminal());
        assert!(!TransferStatus::AwaitingChannel.is_terminal());
        assert!(!TransferStatus::AwaitingReady.is_terminal());
        assert!(!TransferStatus::Streaming.is_terminal());
        assert!(!TransferStatus::Completing.is_terminal());
    }

    #[test]
    fn test_fresh_peer_record_is_idle() {
        let record = PeerTransfers::default();
        assert!(record.is_idle());
    }
}
