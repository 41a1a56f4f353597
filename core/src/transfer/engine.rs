//! Transfer Engine — drives every transfer's state machine.
//!
//! One engine multiplexes all peers. All state mutation happens on the
//! owning event loop; file I/O, hashing, chunk streaming, and timers run in
//! spawned tasks that report back through [`EngineSignal`]s tagged with the
//! session's engine-local ID, so stale firings are recognized and dropped.

use super::session::{Direction, PeerTransfers, TransferSession, TransferStatus};
use crate::channel::{ChannelHandle, ControlMessage};
use crate::config::NodeConfig;
use crate::events::NodeEvent;
use crate::relay::{ForwardPayload, RelayClient, SessionId, TransferMetadata};
use crate::store::FileStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Signals from engine-owned tasks (preparation, streaming, verification,
/// timers) back into the owning event loop
#[derive(Debug)]
pub enum EngineSignal {
    /// Outgoing preparation finished: size known, digest computed
    Prepared {
        peer: SessionId,
        id: u64,
        size: u64,
        hash: Option<String>,
        modified: Option<u64>,
    },
    /// Outgoing preparation failed (missing file, unreadable, not a file)
    PrepareFailed {
        peer: SessionId,
        id: u64,
        reason: String,
    },
    /// One chunk left on the channel
    ChunkSent { peer: SessionId, id: u64, bytes: u64 },
    /// All chunks and file-end sent
    SendComplete { peer: SessionId, id: u64 },
    /// Streaming aborted
    SendFailed {
        peer: SessionId,
        id: u64,
        reason: String,
    },
    /// Receiver-side hash verification finished
    VerifyDone {
        peer: SessionId,
        id: u64,
        ok: bool,
        detail: String,
    },
    /// The transfer-response window elapsed
    ResponseTimeout { peer: SessionId, id: u64 },
    /// The file-ready window elapsed
    ReadyTimeout { peer: SessionId, id: u64 },
}

/// The per-peer transfer state machine owner
pub struct TransferEngine {
    config: NodeConfig,
    relay: RelayClient,
    store: FileStore,
    signal_tx: mpsc::UnboundedSender<EngineSignal>,
    event_tx: mpsc::UnboundedSender<NodeEvent>,
    peers: HashMap<SessionId, PeerTransfers>,
    next_id: u64,
}

impl TransferEngine {
    pub fn new(
        config: NodeConfig,
        relay: RelayClient,
        store: FileStore,
        signal_tx: mpsc::UnboundedSender<EngineSignal>,
        event_tx: mpsc::UnboundedSender<NodeEvent>,
    ) -> Self {
        Self {
            config,
            relay,
            store,
            signal_tx,
            event_tx,
            peers: HashMap::new(),
            next_id: 0,
        }
    }

    /// The active (non-terminal) session for a peer, if any
    pub fn active_session(&self, peer: &SessionId) -> Option<&TransferSession> {
        self.peers.get(peer).and_then(|r| r.active.as_ref())
    }

    /// Number of outgoing sends queued behind the active session
    pub fn queued_outgoing(&self, peer: &SessionId) -> usize {
        self.peers.get(peer).map_or(0, |r| r.queued_out.len())
    }

    // ------------------------------------------------------------------
    // Outgoing flow
    // ------------------------------------------------------------------

    /// Start (or queue) sending a file to a peer.
    ///
    /// A busy peer queues the request FIFO; it starts only once the active
    /// session reaches a terminal state.
    pub fn send_file(&mut self, peer: SessionId, path: PathBuf) {
        if &peer == self.relay.session_id() {
            self.emit(NodeEvent::TransferFailed {
                peer,
                name: path.display().to_string(),
                reason: "cannot send to self".to_string(),
            });
            return;
        }

        let record = self.peers.entry(peer.clone()).or_default();
        if record.active.is_some() {
            info!(%peer, path = %path.display(), "peer busy, send queued");
            record.queued_out.push_back(path);
            return;
        }
        self.start_outgoing(peer, path);
    }

    fn start_outgoing(&mut self, peer: SessionId, path: PathBuf) {
        let id = self.bump_id();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let record = self.peers.entry(peer.clone()).or_default();
        record.active = Some(TransferSession {
            id,
            peer: peer.clone(),
            direction: Direction::Outgoing,
            name,
            size: 0,
            hash: None,
            modified: None,
            bytes_transferred: 0,
            status: TransferStatus::Requested,
            error: None,
            path: Some(path.clone()),
        });
        record.response_pending = false;
        record.last_progress = None;

        // Size and digest come from a pre-pass over the file; the digest
        // dominates for large files, so it runs off the event loop.
        let hash_outgoing = self.config.hash_outgoing;
        let signal_tx = self.signal_tx.clone();
        tokio::spawn(async move {
            let signal = match prepare_outgoing(&path, hash_outgoing).await {
                Ok((size, hash, modified)) => EngineSignal::Prepared {
                    peer,
                    id,
                    size,
                    hash,
                    modified,
                },
                Err(reason) => EngineSignal::PrepareFailed { peer, id, reason },
            };
            let _ = signal_tx.send(signal);
        });
    }

    /// A transfer-response arrived from `from`.
    ///
    /// Returns true when the response was an accept and the caller must
    /// ensure channel negotiation is running for this peer.
    pub async fn on_transfer_response(
        &mut self,
        from: &SessionId,
        accept: bool,
        channel: Option<ChannelHandle>,
    ) -> bool {
        let matches = self.peers.get(from).is_some_and(|record| {
            record.response_pending
                && record.active.as_ref().is_some_and(|s| {
                    s.direction == Direction::Outgoing && s.status == TransferStatus::Requested
                })
        });
        if !matches {
            debug!(peer = %from, accept, "transfer-response without pending request, ignored");
            return false;
        }

        if let Some(record) = self.peers.get_mut(from) {
            record.response_pending = false;
        }

        if !accept {
            self.fail_active(from, TransferStatus::Rejected, "rejected by recipient").await;
            return false;
        }

        match channel {
            Some(channel) => {
                self.begin_handshake(from, channel).await;
                false
            }
            None => {
                if let Some(session) = self.active_mut(from) {
                    session.status = TransferStatus::AwaitingChannel;
                }
                info!(peer = %from, "transfer accepted, negotiating channel");
                true
            }
        }
    }

    /// The direct channel to `peer` opened; release any send waiting on it
    pub async fn on_channel_open(&mut self, peer: &SessionId, channel: ChannelHandle) {
        let waiting = self.active_matches(peer, Direction::Outgoing, TransferStatus::AwaitingChannel);
        if waiting {
            self.begin_handshake(peer, channel).await;
        }
    }

    /// Send file-start and wait (bounded) for file-ready. Channel-open and
    /// receiver-application-ready are distinct events: the receiver must
    /// allocate its destination before any bytes flow.
    async fn begin_handshake(&mut self, peer: &SessionId, channel: ChannelHandle) {
        let Some(session) = self.active_mut(peer) else {
            return;
        };
        let id = session.id;
        session.status = TransferStatus::AwaitingReady;
        let message = ControlMessage::FileStart {
            name: session.name.clone(),
            size: session.size,
            hash: session.hash.clone(),
            modified: session.modified,
        };

        if channel.try_control(message).is_err() {
            self.fail_active(peer, TransferStatus::Errored, "channel closed before file-start")
                .await;
            return;
        }
        debug!(%peer, "file-start sent, awaiting file-ready");

        let signal_tx = self.signal_tx.clone();
        let ready_timeout = self.config.ready_timeout;
        let timer_peer = peer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ready_timeout).await;
            let _ = signal_tx.send(EngineSignal::ReadyTimeout {
                peer: timer_peer,
                id,
            });
        });
    }

    /// The receiver reported file-ready: start streaming chunks
    pub fn on_file_ready(&mut self, peer: &SessionId, channel: ChannelHandle) {
        let Some(record) = self.peers.get_mut(peer) else {
            return;
        };
        let Some(session) = record.active.as_mut() else {
            return;
        };
        if session.direction != Direction::Outgoing
            || session.status != TransferStatus::AwaitingReady
        {
            debug!(%peer, status = ?session.status, "unexpected file-ready, ignored");
            return;
        }

        session.status = TransferStatus::Streaming;
        let id = session.id;
        let path = session.path.clone();
        let size = session.size;
        let name = session.name.clone();
        record.last_progress = Some((Instant::now(), 0));
        info!(%peer, %name, size, "streaming started");

        let chunk_size = self.config.chunk_size;
        let pacing = self.config.pacing_delay;
        let signal_tx = self.signal_tx.clone();
        let task_peer = peer.clone();

        record.send_task = Some(tokio::spawn(async move {
            let Some(path) = path else {
                let _ = signal_tx.send(EngineSignal::SendFailed {
                    peer: task_peer,
                    id,
                    reason: "missing source path".to_string(),
                });
                return;
            };
            match stream_file(
                &path, size, chunk_size, pacing, &channel, &task_peer, id, &signal_tx,
            )
            .await
            {
                Ok(()) => {
                    let signal = if channel.send_control(ControlMessage::FileEnd).await.is_ok() {
                        EngineSignal::SendComplete { peer: task_peer, id }
                    } else {
                        EngineSignal::SendFailed {
                            peer: task_peer,
                            id,
                            reason: "channel closed before file-end".to_string(),
                        }
                    };
                    let _ = signal_tx.send(signal);
                }
                Err(reason) => {
                    let _ = signal_tx.send(EngineSignal::SendFailed {
                        peer: task_peer,
                        id,
                        reason,
                    });
                }
            }
        }));
    }

    // ------------------------------------------------------------------
    // Incoming flow
    // ------------------------------------------------------------------

    /// A transfer-request arrived. Surfaced for a local decision, or queued
    /// when the peer already has an active session.
    pub fn on_transfer_request(&mut self, from: SessionId, metadata: TransferMetadata) {
        let record = self.peers.entry(from.clone()).or_default();
        if record.active.is_some() {
            info!(peer = %from, name = %metadata.name, "peer busy, incoming request queued");
            record.queued_in.push_back(metadata);
            return;
        }
        self.create_incoming(from, metadata);
    }

    fn create_incoming(&mut self, peer: SessionId, metadata: TransferMetadata) {
        let id = self.bump_id();
        let record = self.peers.entry(peer.clone()).or_default();
        record.active = Some(TransferSession {
            id,
            peer: peer.clone(),
            direction: Direction::Incoming,
            name: metadata.name.clone(),
            size: metadata.size,
            hash: metadata.hash,
            modified: metadata.modified,
            bytes_transferred: 0,
            status: TransferStatus::PendingLocalDecision,
            error: None,
            path: None,
        });
        record.last_progress = None;
        self.emit(NodeEvent::TransferRequestReceived {
            peer,
            name: metadata.name,
            size: metadata.size,
        });
    }

    /// Local decision surface accepted the pending incoming transfer
    pub async fn accept(&mut self, peer: &SessionId) {
        if !self.active_matches(peer, Direction::Incoming, TransferStatus::PendingLocalDecision) {
            warn!(%peer, "accept without pending incoming transfer, ignored");
            return;
        }

        // The destination directory must exist before we promise readiness;
        // the record itself is allocated at file-start, whose metadata is
        // authoritative.
        if let Err(e) = self.store.ensure_dir().await {
            self.relay.forward(
                peer.clone(),
                ForwardPayload::TransferResponse { accept: false },
            );
            self.fail_active(
                peer,
                TransferStatus::Errored,
                &format!("storage error: {}", e),
            )
            .await;
            return;
        }

        self.relay.forward(
            peer.clone(),
            ForwardPayload::TransferResponse { accept: true },
        );
        if let Some(session) = self.active_mut(peer) {
            session.status = TransferStatus::Accepted;
        }
        info!(%peer, "incoming transfer accepted");
    }

    /// Local decision surface rejected the pending incoming transfer.
    ///
    /// No download record or on-disk file exists at this point, and none is
    /// created.
    pub async fn reject(&mut self, peer: &SessionId) {
        if !self.active_matches(peer, Direction::Incoming, TransferStatus::PendingLocalDecision) {
            warn!(%peer, "reject without pending incoming transfer, ignored");
            return;
        }
        self.relay.forward(
            peer.clone(),
            ForwardPayload::TransferResponse { accept: false },
        );
        self.fail_active(peer, TransferStatus::Rejected, "rejected locally").await;
    }

    /// file-start arrived on the peer's channel: allocate the destination
    /// using the message's (authoritative) metadata and reply file-ready
    pub async fn on_file_start(
        &mut self,
        peer: &SessionId,
        channel: Option<ChannelHandle>,
        name: String,
        size: u64,
        hash: Option<String>,
        modified: Option<u64>,
    ) {
        if !self.active_matches(peer, Direction::Incoming, TransferStatus::Accepted) {
            warn!(%peer, %name, "file-start without accepted transfer");
            if let Some(channel) = channel {
                let _ = channel.try_control(ControlMessage::FileError {
                    detail: "no accepted transfer".to_string(),
                });
            }
            return;
        }

        match self.store.allocate(peer, &name, size).await {
            Ok(path) => {
                let Some(record) = self.peers.get_mut(peer) else {
                    return;
                };
                if let Some(session) = record.active.as_mut() {
                    session.name = name;
                    session.size = size;
                    session.hash = hash;
                    session.modified = modified;
                    session.path = Some(path);
                    session.status = TransferStatus::Streaming;
                }
                record.last_progress = Some((Instant::now(), 0));

                let ready = channel
                    .as_ref()
                    .map(|c| c.try_control(ControlMessage::FileReady).is_ok())
                    .unwrap_or(false);
                if !ready {
                    self.fail_incoming(peer, "channel closed before file-ready").await;
                }
            }
            Err(e) => {
                if let Some(channel) = channel {
                    let _ = channel.try_control(ControlMessage::FileError {
                        detail: format!("failed to allocate destination: {}", e),
                    });
                }
                self.fail_incoming(peer, &format!("storage error: {}", e)).await;
            }
        }
    }

    /// A binary chunk arrived on the peer's channel
    pub async fn on_data(
        &mut self,
        peer: &SessionId,
        bytes: Vec<u8>,
        channel: Option<ChannelHandle>,
    ) {
        if !self.active_matches(peer, Direction::Incoming, TransferStatus::Streaming) {
            // A frame with no open download record is a sequencing error:
            // terminal for the session it hit, invisible to other peers.
            warn!(%peer, len = bytes.len(), "binary frame with no active download");
            if self
                .active_session(peer)
                .is_some_and(|s| s.direction == Direction::Incoming && !s.status.is_terminal())
            {
                self.fail_incoming(peer, "unexpected binary frame").await;
            }
            return;
        }

        match self.store.append(peer, &bytes).await {
            Ok(outcome) => {
                if outcome.received > outcome.total {
                    if let Some(channel) = channel {
                        let _ = channel.try_control(ControlMessage::FileError {
                            detail: "more bytes than declared".to_string(),
                        });
                    }
                    self.fail_incoming(
                        peer,
                        &format!(
                            "received {} bytes of a declared {}",
                            outcome.received, outcome.total
                        ),
                    )
                    .await;
                    return;
                }
                if let Some(session) = self.active_mut(peer) {
                    session.bytes_transferred = outcome.received;
                }
                self.emit_progress(peer);
            }
            Err(e) => {
                if let Some(channel) = channel {
                    let _ = channel.try_control(ControlMessage::FileError {
                        detail: format!("write failed: {}", e),
                    });
                }
                self.fail_incoming(peer, &format!("write failed: {}", e)).await;
            }
        }
    }

    /// file-end arrived: finalize, cross-check the byte count, verify the
    /// advertised digest when configured
    pub async fn on_file_end(&mut self, peer: &SessionId) {
        if !self.active_matches(peer, Direction::Incoming, TransferStatus::Streaming) {
            warn!(%peer, "file-end with no active download");
            if self
                .active_session(peer)
                .is_some_and(|s| s.direction == Direction::Incoming && !s.status.is_terminal())
            {
                self.fail_incoming(peer, "unexpected file-end").await;
            }
            return;
        }

        let finalized = match self.store.finalize(peer).await {
            Ok(f) => f,
            Err(e) => {
                self.fail_incoming(peer, &format!("finalize failed: {}", e)).await;
                return;
            }
        };

        if finalized.received != finalized.declared_size {
            // Reaching the declared size is necessary for completion; a
            // short or long file is an integrity error, never a silent pass.
            if let Err(e) = tokio::fs::remove_file(&finalized.path).await {
                warn!(%peer, error = %e, "failed to remove mismatched file");
            }
            self.fail_incoming(
                peer,
                &format!(
                    "size mismatch: wrote {} of declared {} bytes",
                    finalized.received, finalized.declared_size
                ),
            )
            .await;
            return;
        }

        let expected = self
            .active_session(peer)
            .and_then(|s| s.hash.clone())
            .filter(|_| self.config.verify_incoming);

        match expected {
            Some(expected) => {
                let Some(session) = self.active_mut(peer) else {
                    return;
                };
                session.status = TransferStatus::Completing;
                let id = session.id;
                let path = finalized.path.clone();
                let signal_tx = self.signal_tx.clone();
                let task_peer = peer.clone();
                tokio::spawn(async move {
                    let (ok, detail) = match FileStore::compute_hash(&path).await {
                        Ok(computed) if computed == expected => (true, String::new()),
                        Ok(computed) => (
                            false,
                            format!("hash mismatch: expected {}, got {}", expected, computed),
                        ),
                        Err(e) => (false, format!("hash verification failed: {}", e)),
                    };
                    let _ = signal_tx.send(EngineSignal::VerifyDone {
                        peer: task_peer,
                        id,
                        ok,
                        detail,
                    });
                });
            }
            None => self.complete_incoming(peer).await,
        }
    }

    /// The peer aborted the transfer over the channel
    pub async fn on_peer_error(&mut self, peer: &SessionId, detail: String) {
        if self
            .active_session(peer)
            .is_some_and(|s| !s.status.is_terminal())
        {
            self.fail_active(
                peer,
                TransferStatus::Errored,
                &format!("peer reported error: {}", detail),
            )
            .await;
        }
    }

    // ------------------------------------------------------------------
    // Cascades
    // ------------------------------------------------------------------

    /// The direct channel closed: force-fail whatever was active
    pub async fn on_channel_closed(&mut self, peer: &SessionId) {
        if self
            .active_session(peer)
            .is_some_and(|s| !s.status.is_terminal())
        {
            self.fail_active(peer, TransferStatus::Errored, "connection closed").await;
        }
    }

    /// Negotiation for the peer failed; only sessions waiting on the
    /// channel are affected
    pub async fn on_connection_failed(&mut self, peer: &SessionId, reason: &str) {
        let waiting = self.active_session(peer).is_some_and(|s| {
            matches!(
                s.status,
                TransferStatus::AwaitingChannel | TransferStatus::Accepted
            )
        });
        if waiting {
            self.fail_active(
                peer,
                TransferStatus::Errored,
                &format!("connection failed: {}", reason),
            )
            .await;
        }
    }

    /// The peer left the relay: fail the active session and drop the queues
    pub async fn on_peer_disconnected(&mut self, peer: &SessionId) {
        if let Some(record) = self.peers.get_mut(peer) {
            record.queued_out.clear();
            record.queued_in.clear();
        }
        if self
            .active_session(peer)
            .is_some_and(|s| !s.status.is_terminal())
        {
            self.fail_active(peer, TransferStatus::Errored, "peer disconnected").await;
        }
        self.peers.remove(peer);
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    /// Apply a signal from one of the engine's own tasks
    pub async fn on_signal(&mut self, signal: EngineSignal) {
        match signal {
            EngineSignal::Prepared {
                peer,
                id,
                size,
                hash,
                modified,
            } => self.handle_prepared(&peer, id, size, hash, modified),
            EngineSignal::PrepareFailed { peer, id, reason } => {
                if self.active_id(&peer) == Some(id) {
                    self.fail_active(&peer, TransferStatus::Errored, &reason).await;
                }
            }
            EngineSignal::ChunkSent { peer, id, bytes } => {
                let streaming = self.active_session(&peer).is_some_and(|s| {
                    s.id == id && s.status == TransferStatus::Streaming
                });
                if streaming {
                    if let Some(session) = self.active_mut(&peer) {
                        session.bytes_transferred += bytes;
                    }
                    self.emit_progress(&peer);
                }
            }
            EngineSignal::SendComplete { peer, id } => {
                let streaming = self.active_session(&peer).is_some_and(|s| {
                    s.id == id && s.status == TransferStatus::Streaming
                });
                if streaming {
                    self.complete_outgoing(&peer).await;
                }
            }
            EngineSignal::SendFailed { peer, id, reason } => {
                if self.active_id(&peer) == Some(id) {
                    self.fail_active(&peer, TransferStatus::Errored, &reason).await;
                }
            }
            EngineSignal::VerifyDone {
                peer,
                id,
                ok,
                detail,
            } => {
                let verifying = self.active_session(&peer).is_some_and(|s| {
                    s.id == id && s.status == TransferStatus::Completing
                });
                if !verifying {
                    return;
                }
                if ok {
                    self.complete_incoming(&peer).await;
                } else {
                    if let Some(path) = self.active_session(&peer).and_then(|s| s.path.clone()) {
                        if let Err(e) = tokio::fs::remove_file(&path).await {
                            warn!(%peer, error = %e, "failed to remove corrupt file");
                        }
                    }
                    self.fail_active(&peer, TransferStatus::Errored, &detail).await;
                }
            }
            EngineSignal::ResponseTimeout { peer, id } => {
                let waiting = self.peers.get(&peer).is_some_and(|r| {
                    r.response_pending
                        && r.active
                            .as_ref()
                            .is_some_and(|s| s.id == id && s.status == TransferStatus::Requested)
                });
                if waiting {
                    self.fail_active(&peer, TransferStatus::Errored, "request timed out").await;
                }
            }
            EngineSignal::ReadyTimeout { peer, id } => {
                let waiting = self.active_session(&peer).is_some_and(|s| {
                    s.id == id && s.status == TransferStatus::AwaitingReady
                });
                if waiting {
                    self.fail_active(
                        &peer,
                        TransferStatus::Errored,
                        "timed out waiting for receiver",
                    )
                    .await;
                }
            }
        }
    }

    fn handle_prepared(
        &mut self,
        peer: &SessionId,
        id: u64,
        size: u64,
        hash: Option<String>,
        modified: Option<u64>,
    ) {
        let Some(record) = self.peers.get_mut(peer) else {
            return;
        };
        let Some(session) = record.active.as_mut() else {
            return;
        };
        if session.id != id || session.status != TransferStatus::Requested {
            return;
        }
        session.size = size;
        session.hash = hash.clone();
        session.modified = modified;
        let name = session.name.clone();
        record.response_pending = true;

        let metadata = TransferMetadata {
            name,
            size,
            hash,
            modified,
        };
        info!(%peer, name = %metadata.name, size, "transfer requested");
        self.relay
            .forward(peer.clone(), ForwardPayload::TransferRequest(metadata));

        let signal_tx = self.signal_tx.clone();
        let response_timeout = self.config.response_timeout;
        let timer_peer = peer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(response_timeout).await;
            let _ = signal_tx.send(EngineSignal::ResponseTimeout {
                peer: timer_peer,
                id,
            });
        });
    }

    // ------------------------------------------------------------------
    // Completion / failure / queue advance
    // ------------------------------------------------------------------

    async fn complete_outgoing(&mut self, peer: &SessionId) {
        let Some(record) = self.peers.get_mut(peer) else {
            return;
        };
        let Some(mut session) = record.active.take() else {
            return;
        };
        record.send_task = None;
        record.last_progress = None;
        session.status = TransferStatus::Completed;
        info!(%peer, name = %session.name, size = session.size, "outgoing transfer completed");
        self.emit(NodeEvent::TransferCompleted {
            peer: peer.clone(),
            direction: Direction::Outgoing,
            name: session.name,
            size: session.size,
            path: None,
        });
        self.advance_queue(peer).await;
    }

    async fn complete_incoming(&mut self, peer: &SessionId) {
        let Some(record) = self.peers.get_mut(peer) else {
            return;
        };
        let Some(mut session) = record.active.take() else {
            return;
        };
        record.last_progress = None;
        session.status = TransferStatus::Completed;
        info!(%peer, name = %session.name, size = session.size, "incoming transfer completed");
        self.emit(NodeEvent::TransferCompleted {
            peer: peer.clone(),
            direction: Direction::Incoming,
            name: session.name,
            size: session.size,
            path: session.path,
        });
        self.advance_queue(peer).await;
    }

    /// Fail an incoming session and discard its partial download
    async fn fail_incoming(&mut self, peer: &SessionId, reason: &str) {
        self.fail_active(peer, TransferStatus::Errored, reason).await;
    }

    /// Retire the active session into a terminal state, emit the matching
    /// event, clean up, and start the next queued transfer
    async fn fail_active(&mut self, peer: &SessionId, terminal: TransferStatus, reason: &str) {
        debug_assert!(terminal.is_terminal());
        let Some(record) = self.peers.get_mut(peer) else {
            return;
        };
        let Some(mut session) = record.active.take() else {
            return;
        };
        if let Some(task) = record.send_task.take() {
            task.abort();
        }
        record.response_pending = false;
        record.last_progress = None;

        session.status = terminal;
        match terminal {
            TransferStatus::Rejected => {
                info!(%peer, name = %session.name, "transfer rejected");
                self.emit(NodeEvent::TransferRejected {
                    peer: peer.clone(),
                    name: session.name.clone(),
                });
            }
            _ => {
                session.error = Some(reason.to_string());
                warn!(%peer, name = %session.name, %reason, "transfer failed");
                self.emit(NodeEvent::TransferFailed {
                    peer: peer.clone(),
                    name: session.name.clone(),
                    reason: reason.to_string(),
                });
            }
        }

        // A canceled incoming transfer must never leave an open write handle
        if session.direction == Direction::Incoming {
            self.store.discard(peer).await;
        }
        self.advance_queue(peer).await;
    }

    /// Start the next queued transfer for a now-idle peer
    async fn advance_queue(&mut self, peer: &SessionId) {
        let next_out = match self.peers.get_mut(peer) {
            Some(record) if record.active.is_none() => record.queued_out.pop_front(),
            _ => return,
        };
        if let Some(path) = next_out {
            self.start_outgoing(peer.clone(), path);
            return;
        }

        let next_in = self
            .peers
            .get_mut(peer)
            .and_then(|record| record.queued_in.pop_front());
        if let Some(metadata) = next_in {
            self.create_incoming(peer.clone(), metadata);
            return;
        }

        if self.peers.get(peer).is_some_and(|r| r.is_idle()) {
            self.peers.remove(peer);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn active_mut(&mut self, peer: &SessionId) -> Option<&mut TransferSession> {
        self.peers.get_mut(peer).and_then(|r| r.active.as_mut())
    }

    fn active_id(&self, peer: &SessionId) -> Option<u64> {
        self.active_session(peer).map(|s| s.id)
    }

    fn active_matches(
        &self,
        peer: &SessionId,
        direction: Direction,
        status: TransferStatus,
    ) -> bool {
        self.active_session(peer)
            .is_some_and(|s| s.direction == direction && s.status == status)
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_progress(&mut self, peer: &SessionId) {
        let Some(record) = self.peers.get_mut(peer) else {
            return;
        };
        let Some(session) = record.active.as_ref() else {
            return;
        };

        let now = Instant::now();
        let throughput = record.last_progress.and_then(|(at, bytes)| {
            let elapsed = now.duration_since(at).as_secs_f64();
            if elapsed > 0.0 && session.bytes_transferred >= bytes {
                Some((session.bytes_transferred - bytes) as f64 / elapsed)
            } else {
                None
            }
        });
        record.last_progress = Some((now, session.bytes_transferred));

        let percent = if session.size == 0 {
            100.0
        } else {
            (session.bytes_transferred as f64 / session.size as f64) * 100.0
        };
        let event = NodeEvent::TransferProgress {
            peer: peer.clone(),
            direction: session.direction,
            name: session.name.clone(),
            bytes_transferred: session.bytes_transferred,
            total_bytes: session.size,
            percent,
            throughput,
        };
        self.emit(event);
    }

    fn bump_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Stat the source and optionally run the digest pre-pass
async fn prepare_outgoing(
    path: &PathBuf,
    hash_outgoing: bool,
) -> Result<(u64, Option<String>, Option<u64>), String> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| format!("cannot read source file: {}", e))?;
    if !metadata.is_file() {
        return Err("source is not a regular file".to_string());
    }
    let size = metadata.len();
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs());
    let hash = if hash_outgoing {
        Some(
            FileStore::compute_hash(path)
                .await
                .map_err(|e| format!("hash pre-pass failed: {}", e))?,
        )
    } else {
        None
    };
    Ok((size, hash, modified))
}

/// Stream exactly `declared_size` bytes as fixed-size chunks with a pacing
/// delay between sends
#[allow(clippy::too_many_arguments)]
async fn stream_file(
    path: &PathBuf,
    declared_size: u64,
    chunk_size: usize,
    pacing: std::time::Duration,
    channel: &ChannelHandle,
    peer: &SessionId,
    id: u64,
    signal_tx: &mpsc::UnboundedSender<EngineSignal>,
) -> Result<(), String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| format!("cannot open source file: {}", e))?;
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut remaining = declared_size;

    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file
            .read(&mut buf[..want])
            .await
            .map_err(|e| format!("read failed: {}", e))?;
        if n == 0 {
            return Err("source file shorter than declared size".to_string());
        }
        channel
            .send_data(buf[..n].to_vec())
            .await
            .map_err(|_| "channel closed mid-stream".to_string())?;
        remaining -= n as u64;
        let _ = signal_tx.send(EngineSignal::ChunkSent {
            peer: peer.clone(),
            id,
            bytes: n as u64,
        });
        if !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{frame, spawn_channel, Frame};
    use crate::relay::ClientMessage;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    struct Harness {
        engine: TransferEngine,
        relay_rx: mpsc::UnboundedReceiver<ClientMessage>,
        signal_rx: mpsc::UnboundedReceiver<EngineSignal>,
        event_rx: mpsc::UnboundedReceiver<NodeEvent>,
        dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            download_dir: dir.path().to_path_buf(),
            chunk_size: 16,
            pacing_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let store = FileStore::new(dir.path());
        let engine = TransferEngine::new(
            config,
            RelayClient::from_parts(SessionId::from("local"), relay_tx),
            store,
            signal_tx,
            event_tx,
        );
        Harness {
            engine,
            relay_rx,
            signal_rx,
            event_rx,
            dir,
        }
    }

    fn peer(n: &str) -> SessionId {
        SessionId::from(n)
    }

    fn write_source(dir: &std::path::Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<NodeEvent>) -> NodeEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    async fn next_signal(rx: &mut mpsc::UnboundedReceiver<EngineSignal>) -> EngineSignal {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for signal")
            .expect("signal stream closed")
    }

    /// Pump signals into the engine until the outgoing request has gone out
    async fn pump_until_requested(h: &mut Harness) {
        loop {
            let signal = next_signal(&mut h.signal_rx).await;
            let was_prepared = matches!(signal, EngineSignal::Prepared { .. });
            h.engine.on_signal(signal).await;
            if was_prepared {
                return;
            }
        }
    }

    fn take_forward(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> (SessionId, ForwardPayload) {
        match rx.try_recv().expect("expected a relay forward") {
            ClientMessage::Forward { target, payload } => (target, payload),
            other => panic!("Expected Forward, got {}", other.message_type()),
        }
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        (accepted, dial.await.unwrap())
    }

    #[tokio::test]
    async fn test_second_send_to_busy_peer_queues_fifo() {
        let mut h = harness();
        let p = peer("bbbb");
        let first = write_source(h.dir.path(), "first.bin", b"1111");
        let second = write_source(h.dir.path(), "second.bin", b"2222");

        h.engine.send_file(p.clone(), first);
        h.engine.send_file(p.clone(), second);

        let active = h.engine.active_session(&p).expect("no active session");
        assert_eq!(active.name, "first.bin");
        assert_eq!(active.status, TransferStatus::Requested);
        assert_eq!(h.engine.queued_outgoing(&p), 1);
    }

    #[tokio::test]
    async fn test_prepared_request_carries_size_and_hash() {
        let mut h = harness();
        let p = peer("bbbb");
        let path = write_source(h.dir.path(), "hello.txt", b"hello world");

        h.engine.send_file(p.clone(), path);
        pump_until_requested(&mut h).await;

        let (target, payload) = take_forward(&mut h.relay_rx);
        assert_eq!(target, p);
        match payload {
            ForwardPayload::TransferRequest(meta) => {
                assert_eq!(meta.name, "hello.txt");
                assert_eq!(meta.size, 11);
                assert_eq!(
                    meta.hash.as_deref(),
                    Some("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
                );
            }
            other => panic!("Expected TransferRequest, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_missing_source_fails_transfer() {
        let mut h = harness();
        let p = peer("bbbb");
        h.engine
            .send_file(p.clone(), h.dir.path().join("does-not-exist.bin"));

        let signal = next_signal(&mut h.signal_rx).await;
        assert!(matches!(signal, EngineSignal::PrepareFailed { .. }));
        h.engine.on_signal(signal).await;

        match next_event(&mut h.event_rx).await {
            NodeEvent::TransferFailed { name, .. } => assert_eq!(name, "does-not-exist.bin"),
            other => panic!("Expected TransferFailed, got {:?}", other),
        }
        assert!(h.engine.active_session(&p).is_none());
    }

    #[tokio::test]
    async fn test_reject_response_fails_session_and_advances_queue() {
        let mut h = harness();
        let p = peer("bbbb");
        let first = write_source(h.dir.path(), "first.bin", b"1111");
        let second = write_source(h.dir.path(), "second.bin", b"2222");

        h.engine.send_file(p.clone(), first);
        h.engine.send_file(p.clone(), second);
        pump_until_requested(&mut h).await;
        let _ = take_forward(&mut h.relay_rx);

        let need_channel = h.engine.on_transfer_response(&p, false, None).await;
        assert!(!need_channel);

        match next_event(&mut h.event_rx).await {
            NodeEvent::TransferRejected { name, .. } => assert_eq!(name, "first.bin"),
            other => panic!("Expected TransferRejected, got {:?}", other),
        }

        // The queued send takes over immediately
        let active = h.engine.active_session(&p).expect("queue did not advance");
        assert_eq!(active.name, "second.bin");
        assert_eq!(h.engine.queued_outgoing(&p), 0);
        pump_until_requested(&mut h).await;
        let (_, payload) = take_forward(&mut h.relay_rx);
        assert!(matches!(payload, ForwardPayload::TransferRequest(_)));
    }

    #[tokio::test]
    async fn test_accept_without_channel_asks_for_negotiation() {
        let mut h = harness();
        let p = peer("bbbb");
        let path = write_source(h.dir.path(), "file.bin", b"payload");

        h.engine.send_file(p.clone(), path);
        pump_until_requested(&mut h).await;

        let need_channel = h.engine.on_transfer_response(&p, true, None).await;
        assert!(need_channel);
        assert_eq!(
            h.engine.active_session(&p).unwrap().status,
            TransferStatus::AwaitingChannel
        );
    }

    #[tokio::test]
    async fn test_unsolicited_response_is_ignored() {
        let mut h = harness();
        let p = peer("bbbb");
        let need_channel = h.engine.on_transfer_response(&p, true, None).await;
        assert!(!need_channel);
        assert!(h.engine.active_session(&p).is_none());
    }

    #[tokio::test]
    async fn test_response_timeout_fails_with_timeout_cause() {
        let mut h = harness();
        let p = peer("bbbb");
        let path = write_source(h.dir.path(), "slow.bin", b"data");

        h.engine.send_file(p.clone(), path);
        pump_until_requested(&mut h).await;
        let id = h.engine.active_session(&p).unwrap().id;

        h.engine
            .on_signal(EngineSignal::ResponseTimeout { peer: p.clone(), id })
            .await;

        match next_event(&mut h.event_rx).await {
            NodeEvent::TransferFailed { reason, .. } => {
                assert_eq!(reason, "request timed out");
            }
            other => panic!("Expected TransferFailed, got {:?}", other),
        }
        assert!(h.engine.active_session(&p).is_none());
    }

    #[tokio::test]
    async fn test_stale_timeout_is_ignored() {
        let mut h = harness();
        let p = peer("bbbb");
        let path = write_source(h.dir.path(), "keep.bin", b"data");

        h.engine.send_file(p.clone(), path);
        pump_until_requested(&mut h).await;
        let id = h.engine.active_session(&p).unwrap().id;

        // A timer from some earlier, retired session must not fire this one
        h.engine
            .on_signal(EngineSignal::ResponseTimeout {
                peer: p.clone(),
                id: id + 100,
            })
            .await;
        assert!(h.engine.active_session(&p).is_some());
    }

    #[tokio::test]
    async fn test_outgoing_streams_exact_bytes_with_chunk_boundaries() {
        let mut h = harness();
        let p = peer("bbbb");
        // 40 bytes at chunk_size 16: frames of 16, 16, 8
        let content: Vec<u8> = (0u8..40).collect();
        let path = write_source(h.dir.path(), "data.bin", &content);

        h.engine.send_file(p.clone(), path);
        pump_until_requested(&mut h).await;
        let _ = take_forward(&mut h.relay_rx);

        let (ours, mut theirs) = connected_pair().await;
        let (chan_events_tx, _chan_events_rx) = mpsc::unbounded_channel();
        let handle = spawn_channel(p.clone(), ours, chan_events_tx);

        let need_channel = h
            .engine
            .on_transfer_response(&p, true, Some(handle.clone()))
            .await;
        assert!(!need_channel);

        // The receiver sees file-start and replies ready
        match frame::read_frame(&mut theirs).await.unwrap() {
            Frame::Control(ControlMessage::FileStart { name, size, .. }) => {
                assert_eq!(name, "data.bin");
                assert_eq!(size, 40);
            }
            other => panic!("Expected file-start, got {:?}", other),
        }
        h.engine.on_file_ready(&p, handle);

        // Drive the engine from its own signals until completion
        let reader = tokio::spawn(async move {
            let mut frames = Vec::new();
            loop {
                match frame::read_frame(&mut theirs).await.unwrap() {
                    Frame::Data(bytes) => frames.push(bytes),
                    Frame::Control(ControlMessage::FileEnd) => break,
                    other => panic!("Unexpected frame: {:?}", other),
                }
            }
            frames
        });

        loop {
            let signal = next_signal(&mut h.signal_rx).await;
            let done = matches!(signal, EngineSignal::SendComplete { .. });
            h.engine.on_signal(signal).await;
            if done {
                break;
            }
        }

        // Progress strictly increases and terminates at the declared size
        let mut last = 0u64;
        let mut completed = false;
        while let Ok(event) = h.event_rx.try_recv() {
            match event {
                NodeEvent::TransferProgress {
                    bytes_transferred, ..
                } => {
                    assert!(bytes_transferred > last);
                    last = bytes_transferred;
                }
                NodeEvent::TransferCompleted { size, .. } => {
                    assert_eq!(size, 40);
                    completed = true;
                }
                other => panic!("Unexpected event: {:?}", other),
            }
        }
        assert!(completed);
        assert_eq!(last, 40);

        let frames = reader.await.unwrap();
        assert_eq!(
            frames.iter().map(|f| f.len()).collect::<Vec<_>>(),
            vec![16, 16, 8]
        );
        assert_eq!(frames.concat(), content);
        assert!(h.engine.active_session(&p).is_none());
    }

    #[tokio::test]
    async fn test_incoming_flow_writes_verifies_and_completes() {
        let mut h = harness();
        let p = peer("bbbb");
        let content = b"the quick brown fox jumps over the lazy dog";
        let digest = {
            use sha2::{Digest, Sha256};
            hex::encode(Sha256::digest(content))
        };

        h.engine.on_transfer_request(
            p.clone(),
            TransferMetadata {
                name: "fox.txt".to_string(),
                size: content.len() as u64,
                hash: Some(digest.clone()),
                modified: None,
            },
        );
        match next_event(&mut h.event_rx).await {
            NodeEvent::TransferRequestReceived { name, size, .. } => {
                assert_eq!(name, "fox.txt");
                assert_eq!(size, content.len() as u64);
            }
            other => panic!("Expected TransferRequestReceived, got {:?}", other),
        }

        h.engine.accept(&p).await;
        let (_, payload) = take_forward(&mut h.relay_rx);
        assert!(matches!(
            payload,
            ForwardPayload::TransferResponse { accept: true }
        ));
        assert_eq!(
            h.engine.active_session(&p).unwrap().status,
            TransferStatus::Accepted
        );

        let (ours, mut theirs) = connected_pair().await;
        let (chan_events_tx, _chan_events_rx) = mpsc::unbounded_channel();
        let handle = spawn_channel(p.clone(), ours, chan_events_tx);

        h.engine
            .on_file_start(
                &p,
                Some(handle.clone()),
                "fox.txt".to_string(),
                content.len() as u64,
                Some(digest),
                None,
            )
            .await;
        match frame::read_frame(&mut theirs).await.unwrap() {
            Frame::Control(ControlMessage::FileReady) => {}
            other => panic!("Expected file-ready, got {:?}", other),
        }

        h.engine
            .on_data(&p, content[..20].to_vec(), Some(handle.clone()))
            .await;
        h.engine
            .on_data(&p, content[20..].to_vec(), Some(handle.clone()))
            .await;
        h.engine.on_file_end(&p).await;

        // Verification runs off-loop and reports back
        let signal = next_signal(&mut h.signal_rx).await;
        match &signal {
            EngineSignal::VerifyDone { ok, .. } => assert!(*ok),
            other => panic!("Expected VerifyDone, got {:?}", other),
        }
        h.engine.on_signal(signal).await;

        let mut final_path = None;
        loop {
            match next_event(&mut h.event_rx).await {
                NodeEvent::TransferProgress { .. } => continue,
                NodeEvent::TransferCompleted { size, path, .. } => {
                    assert_eq!(size, content.len() as u64);
                    final_path = path;
                    break;
                }
                other => panic!("Unexpected event: {:?}", other),
            }
        }
        let final_path = final_path.expect("completed without a path");
        assert_eq!(std::fs::read(&final_path).unwrap(), content);
        assert!(h.engine.active_session(&p).is_none());
    }

    #[tokio::test]
    async fn test_reject_creates_no_download_record_or_file() {
        let mut h = harness();
        let p = peer("bbbb");

        h.engine.on_transfer_request(
            p.clone(),
            TransferMetadata {
                name: "unwanted.bin".to_string(),
                size: 10,
                hash: None,
                modified: None,
            },
        );
        let _ = next_event(&mut h.event_rx).await;

        h.engine.reject(&p).await;
        let (_, payload) = take_forward(&mut h.relay_rx);
        assert!(matches!(
            payload,
            ForwardPayload::TransferResponse { accept: false }
        ));
        match next_event(&mut h.event_rx).await {
            NodeEvent::TransferRejected { name, .. } => assert_eq!(name, "unwanted.bin"),
            other => panic!("Expected TransferRejected, got {:?}", other),
        }

        assert!(h.engine.active_session(&p).is_none());
        let entries: Vec<_> = std::fs::read_dir(h.dir.path()).unwrap().collect();
        assert!(entries.is_empty(), "rejection must not touch the disk");
    }

    #[tokio::test]
    async fn test_corrupted_stream_ends_errored_never_completed() {
        let mut h = harness();
        let p = peer("bbbb");
        let advertised = {
            use sha2::{Digest, Sha256};
            hex::encode(Sha256::digest(b"good data!"))
        };

        h.engine.on_transfer_request(
            p.clone(),
            TransferMetadata {
                name: "data.bin".to_string(),
                size: 10,
                hash: Some(advertised.clone()),
                modified: None,
            },
        );
        let _ = next_event(&mut h.event_rx).await;
        h.engine.accept(&p).await;
        let _ = take_forward(&mut h.relay_rx);

        let (ours, mut theirs) = connected_pair().await;
        let (chan_events_tx, _chan_events_rx) = mpsc::unbounded_channel();
        let handle = spawn_channel(p.clone(), ours, chan_events_tx);

        h.engine
            .on_file_start(
                &p,
                Some(handle.clone()),
                "data.bin".to_string(),
                10,
                Some(advertised),
                None,
            )
            .await;
        let _ = frame::read_frame(&mut theirs).await.unwrap();

        // Same length, different bytes
        h.engine
            .on_data(&p, b"evil data!".to_vec(), Some(handle.clone()))
            .await;
        let path = h.engine.active_session(&p).unwrap().path.clone().unwrap();
        h.engine.on_file_end(&p).await;

        let signal = next_signal(&mut h.signal_rx).await;
        match &signal {
            EngineSignal::VerifyDone { ok, .. } => assert!(!*ok),
            other => panic!("Expected VerifyDone, got {:?}", other),
        }
        h.engine.on_signal(signal).await;

        let mut failed = false;
        loop {
            match next_event(&mut h.event_rx).await {
                NodeEvent::TransferProgress { .. } => continue,
                NodeEvent::TransferFailed { reason, .. } => {
                    assert!(reason.contains("hash mismatch"));
                    failed = true;
                    break;
                }
                NodeEvent::TransferCompleted { .. } => {
                    panic!("corrupted stream must never complete")
                }
                other => panic!("Unexpected event: {:?}", other),
            }
        }
        assert!(failed);
        assert!(!path.exists(), "corrupt file must be discarded");
    }

    #[tokio::test]
    async fn test_size_mismatch_at_file_end_is_integrity_error() {
        let mut h = harness();
        let p = peer("bbbb");

        h.engine.on_transfer_request(
            p.clone(),
            TransferMetadata {
                name: "short.bin".to_string(),
                size: 10,
                hash: None,
                modified: None,
            },
        );
        let _ = next_event(&mut h.event_rx).await;
        h.engine.accept(&p).await;
        let _ = take_forward(&mut h.relay_rx);

        let (ours, mut theirs) = connected_pair().await;
        let (chan_events_tx, _chan_events_rx) = mpsc::unbounded_channel();
        let handle = spawn_channel(p.clone(), ours, chan_events_tx);

        h.engine
            .on_file_start(&p, Some(handle.clone()), "short.bin".to_string(), 10, None, None)
            .await;
        let _ = frame::read_frame(&mut theirs).await.unwrap();

        h.engine.on_data(&p, b"1234".to_vec(), Some(handle.clone())).await;
        let path = h.engine.active_session(&p).unwrap().path.clone().unwrap();
        h.engine.on_file_end(&p).await;

        let mut saw_failure = false;
        while let Ok(event) = h.event_rx.try_recv() {
            if let NodeEvent::TransferFailed { reason, .. } = event {
                assert!(reason.contains("size mismatch"));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_channel_close_mid_stream_discards_download() {
        let mut h = harness();
        let p = peer("bbbb");

        h.engine.on_transfer_request(
            p.clone(),
            TransferMetadata {
                name: "partial.bin".to_string(),
                size: 100,
                hash: None,
                modified: None,
            },
        );
        let _ = next_event(&mut h.event_rx).await;
        h.engine.accept(&p).await;
        let _ = take_forward(&mut h.relay_rx);

        let (ours, mut theirs) = connected_pair().await;
        let (chan_events_tx, _chan_events_rx) = mpsc::unbounded_channel();
        let handle = spawn_channel(p.clone(), ours, chan_events_tx);

        h.engine
            .on_file_start(&p, Some(handle.clone()), "partial.bin".to_string(), 100, None, None)
            .await;
        let _ = frame::read_frame(&mut theirs).await.unwrap();
        h.engine.on_data(&p, vec![0u8; 40], Some(handle.clone())).await;
        let path = h.engine.active_session(&p).unwrap().path.clone().unwrap();

        h.engine.on_channel_closed(&p).await;

        let mut saw_failure = false;
        while let Ok(event) = h.event_rx.try_recv() {
            if let NodeEvent::TransferFailed { reason, .. } = event {
                assert_eq!(reason, "connection closed");
                saw_failure = true;
            }
        }
        assert!(saw_failure);
        assert!(!path.exists(), "no partial file may remain");
        assert!(h.engine.active_session(&p).is_none());
    }

    #[tokio::test]
    async fn test_unexpected_binary_frame_fails_session() {
        let mut h = harness();
        let p = peer("bbbb");

        h.engine.on_transfer_request(
            p.clone(),
            TransferMetadata {
                name: "x.bin".to_string(),
                size: 4,
                hash: None,
                modified: None,
            },
        );
        let _ = next_event(&mut h.event_rx).await;
        h.engine.accept(&p).await;
        let _ = take_forward(&mut h.relay_rx);

        // Binary data before file-start: sequencing error, terminal
        h.engine.on_data(&p, vec![1, 2, 3], None).await;
        match next_event(&mut h.event_rx).await {
            NodeEvent::TransferFailed { reason, .. } => {
                assert_eq!(reason, "unexpected binary frame");
            }
            other => panic!("Expected TransferFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_busy_peer_queues_incoming_and_surfaces_later() {
        let mut h = harness();
        let p = peer("bbbb");

        h.engine.on_transfer_request(
            p.clone(),
            TransferMetadata {
                name: "first.bin".to_string(),
                size: 1,
                hash: None,
                modified: None,
            },
        );
        h.engine.on_transfer_request(
            p.clone(),
            TransferMetadata {
                name: "second.bin".to_string(),
                size: 2,
                hash: None,
                modified: None,
            },
        );

        // Only the first is surfaced
        match next_event(&mut h.event_rx).await {
            NodeEvent::TransferRequestReceived { name, .. } => assert_eq!(name, "first.bin"),
            other => panic!("Unexpected event: {:?}", other),
        }
        assert!(h.event_rx.try_recv().is_err());

        h.engine.reject(&p).await;
        let _ = take_forward(&mut h.relay_rx);
        let _ = next_event(&mut h.event_rx).await; // TransferRejected

        // Now the queued request becomes the active decision
        match next_event(&mut h.event_rx).await {
            NodeEvent::TransferRequestReceived { name, size, .. } => {
                assert_eq!(name, "second.bin");
                assert_eq!(size, 2);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peer_disconnect_fails_active_and_drops_queue() {
        let mut h = harness();
        let p = peer("bbbb");
        let first = write_source(h.dir.path(), "first.bin", b"1111");
        let second = write_source(h.dir.path(), "second.bin", b"2222");

        h.engine.send_file(p.clone(), first);
        h.engine.send_file(p.clone(), second);
        pump_until_requested(&mut h).await;

        h.engine.on_peer_disconnected(&p).await;

        match next_event(&mut h.event_rx).await {
            NodeEvent::TransferFailed { reason, .. } => assert_eq!(reason, "peer disconnected"),
            other => panic!("Expected TransferFailed, got {:?}", other),
        }
        assert!(h.engine.active_session(&p).is_none());
        assert_eq!(h.engine.queued_outgoing(&p), 0);
    }

    #[tokio::test]
    async fn test_send_to_self_fails_immediately() {
        let mut h = harness();
        h.engine
            .send_file(SessionId::from("local"), PathBuf::from("x.bin"));
        match next_event(&mut h.event_rx).await {
            NodeEvent::TransferFailed { reason, .. } => {
                assert_eq!(reason, "cannot send to self");
            }
            other => panic!("Expected TransferFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_file_completes_without_chunks() {
        let mut h = harness();
        let p = peer("bbbb");

        h.engine.on_transfer_request(
            p.clone(),
            TransferMetadata {
                name: "empty.bin".to_string(),
                size: 0,
                hash: None,
                modified: None,
            },
        );
        let _ = next_event(&mut h.event_rx).await;
        h.engine.accept(&p).await;
        let _ = take_forward(&mut h.relay_rx);

        let (ours, mut theirs) = connected_pair().await;
        let (chan_events_tx, _chan_events_rx) = mpsc::unbounded_channel();
        let handle = spawn_channel(p.clone(), ours, chan_events_tx);

        h.engine
            .on_file_start(&p, Some(handle.clone()), "empty.bin".to_string(), 0, None, None)
            .await;
        let _ = frame::read_frame(&mut theirs).await.unwrap();
        h.engine.on_file_end(&p).await;

        match next_event(&mut h.event_rx).await {
            NodeEvent::TransferCompleted { size, path, .. } => {
                assert_eq!(size, 0);
                let path = path.unwrap();
                assert_eq!(std::fs::metadata(path).unwrap().len(), 0);
            }
            other => panic!("Expected TransferCompleted, got {:?}", other),
        }
    }
}
