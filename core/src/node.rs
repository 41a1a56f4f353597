//! Node — the single owner of all per-peer state.
//!
//! One event-loop task owns the peer set, the negotiator, the transfer
//! engine, and the file store. Commands, relay events, channel events, and
//! task signals arrive on channels and are applied sequentially, so the
//! keyed maps never need locks. Everything observable leaves through the
//! [`NodeEvent`] stream.

use crate::channel::{ChannelEvent, ControlMessage};
use crate::config::NodeConfig;
use crate::events::NodeEvent;
use crate::negotiate::{NegotiateSignal, NegotiationOutcome, Negotiator};
use crate::relay::{
    ForwardPayload, RelayClient, RelayClientError, RelayEvent, SessionId,
};
use crate::store::FileStore;
use crate::transfer::{EngineSignal, TransferEngine};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Node startup errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Relay connection failed: {0}")]
    Relay(#[from] RelayClientError),
}

/// Commands accepted by a running node
#[derive(Debug)]
enum NodeCommand {
    SendFile { peer: SessionId, path: PathBuf },
    Accept { peer: SessionId },
    Reject { peer: SessionId },
    Refresh,
    Shutdown,
}

/// Handle to a running node.
///
/// All methods are fire-and-forget; results surface on the event stream.
#[derive(Clone)]
pub struct NodeHandle {
    session_id: SessionId,
    cmd_tx: mpsc::UnboundedSender<NodeCommand>,
}

impl NodeHandle {
    /// The session ID the relay assigned to this node
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Send (or queue) a file to a peer
    pub fn send_file(&self, peer: SessionId, path: PathBuf) {
        let _ = self.cmd_tx.send(NodeCommand::SendFile { peer, path });
    }

    /// Accept the pending incoming transfer from a peer
    pub fn accept(&self, peer: SessionId) {
        let _ = self.cmd_tx.send(NodeCommand::Accept { peer });
    }

    /// Reject the pending incoming transfer from a peer
    pub fn reject(&self, peer: SessionId) {
        let _ = self.cmd_tx.send(NodeCommand::Reject { peer });
    }

    /// Request an immediate discovery refresh
    pub fn refresh(&self) {
        let _ = self.cmd_tx.send(NodeCommand::Refresh);
    }

    /// Stop the node's event loop
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(NodeCommand::Shutdown);
    }
}

/// The node's event loop and its owned state
pub struct Node {
    relay: RelayClient,
    relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    relay_alive: bool,
    negotiator: Negotiator,
    engine: TransferEngine,
    peers: HashSet<SessionId>,
    event_tx: mpsc::UnboundedSender<NodeEvent>,
    cmd_rx: mpsc::UnboundedReceiver<NodeCommand>,
    chan_rx: mpsc::UnboundedReceiver<(SessionId, ChannelEvent)>,
    neg_rx: mpsc::UnboundedReceiver<NegotiateSignal>,
    eng_rx: mpsc::UnboundedReceiver<EngineSignal>,
}

impl Node {
    /// Connect to the relay and start the event loop.
    ///
    /// Returns the command handle and the event stream.
    pub async fn start(
        config: NodeConfig,
    ) -> Result<(NodeHandle, mpsc::UnboundedReceiver<NodeEvent>), NodeError> {
        let (relay, relay_events) = RelayClient::connect(config.relay_client_config()).await?;
        let session_id = relay.session_id().clone();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (chan_tx, chan_rx) = mpsc::unbounded_channel();
        let (neg_tx, neg_rx) = mpsc::unbounded_channel();
        let (eng_tx, eng_rx) = mpsc::unbounded_channel();

        let negotiator = Negotiator::new(
            session_id.clone(),
            config.channel_bind.clone(),
            config.advertise_host.clone(),
            config.negotiation_timeout,
            relay.clone(),
            neg_tx,
            chan_tx,
        );
        let store = FileStore::new(config.download_dir.clone());
        let engine = TransferEngine::new(
            config,
            relay.clone(),
            store,
            eng_tx,
            event_tx.clone(),
        );

        let node = Node {
            relay,
            relay_events,
            relay_alive: true,
            negotiator,
            engine,
            peers: HashSet::new(),
            event_tx,
            cmd_rx,
            chan_rx,
            neg_rx,
            eng_rx,
        };
        info!(session = %session_id, "node started");
        tokio::spawn(node.run());

        Ok((
            NodeHandle {
                session_id,
                cmd_tx,
            },
            event_rx,
        ))
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(NodeCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                event = self.relay_events.recv(), if self.relay_alive => {
                    match event {
                        Some(event) => self.handle_relay_event(event).await,
                        None => {
                            self.relay_alive = false;
                            self.emit(NodeEvent::RelayDisconnected);
                        }
                    }
                }
                Some((peer, event)) = self.chan_rx.recv() => {
                    self.handle_channel_event(peer, event).await;
                }
                Some(signal) = self.neg_rx.recv() => {
                    self.handle_negotiate_signal(signal).await;
                }
                Some(signal) = self.eng_rx.recv() => {
                    self.engine.on_signal(signal).await;
                }
            }
        }
        debug!("node event loop stopped");
    }

    async fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::SendFile { peer, path } => self.engine.send_file(peer, path),
            NodeCommand::Accept { peer } => self.engine.accept(&peer).await,
            NodeCommand::Reject { peer } => self.engine.reject(&peer).await,
            NodeCommand::Refresh => self.relay.discover(),
            NodeCommand::Shutdown => {}
        }
    }

    async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::PeerList(list) => {
                // The set is replaced wholesale; duplicates collapse by ID
                self.peers = list.into_iter().collect();
                let mut peers: Vec<SessionId> = self.peers.iter().cloned().collect();
                peers.sort();
                self.emit(NodeEvent::PeersUpdated(peers));
            }
            RelayEvent::Delivery { from, payload } => match payload {
                ForwardPayload::Descriptor(descriptor) => {
                    self.negotiator.handle_descriptor(from, descriptor);
                }
                ForwardPayload::TransferRequest(metadata) => {
                    self.engine.on_transfer_request(from, metadata);
                }
                ForwardPayload::TransferResponse { accept } => {
                    let channel = self.negotiator.channel(&from);
                    let need_channel = self
                        .engine
                        .on_transfer_response(&from, accept, channel)
                        .await;
                    if need_channel {
                        self.negotiator.initiate(from).await;
                    }
                }
            },
            RelayEvent::PeerDisconnected(id) => {
                self.peers.remove(&id);
                self.negotiator.teardown(&id);
                self.engine.on_peer_disconnected(&id).await;
                self.emit(NodeEvent::PeerDisconnected(id));
            }
            RelayEvent::Disconnected => {
                self.relay_alive = false;
                self.emit(NodeEvent::RelayDisconnected);
            }
        }
    }

    async fn handle_channel_event(&mut self, peer: SessionId, event: ChannelEvent) {
        match event {
            ChannelEvent::Control(ControlMessage::FileStart {
                name,
                size,
                hash,
                modified,
            }) => {
                let channel = self.negotiator.channel(&peer);
                self.engine
                    .on_file_start(&peer, channel, name, size, hash, modified)
                    .await;
            }
            ChannelEvent::Control(ControlMessage::FileReady) => {
                if let Some(channel) = self.negotiator.channel(&peer) {
                    self.engine.on_file_ready(&peer, channel);
                }
            }
            ChannelEvent::Control(ControlMessage::FileEnd) => {
                self.engine.on_file_end(&peer).await;
            }
            ChannelEvent::Control(ControlMessage::FileError { detail }) => {
                self.engine.on_peer_error(&peer, detail).await;
            }
            ChannelEvent::Control(ControlMessage::Hello { .. }) => {
                // Identification is consumed during accept; late hellos are
                // harmless noise
                debug!(%peer, "stray hello frame ignored");
            }
            ChannelEvent::Data(bytes) => {
                let channel = self.negotiator.channel(&peer);
                self.engine.on_data(&peer, bytes, channel).await;
            }
            ChannelEvent::Closed => {
                if self.negotiator.handle_channel_closed(&peer) {
                    self.engine.on_channel_closed(&peer).await;
                }
            }
        }
    }

    async fn handle_negotiate_signal(&mut self, signal: NegotiateSignal) {
        match self.negotiator.apply_signal(signal) {
            NegotiationOutcome::Opened(peer, channel) => {
                self.emit(NodeEvent::ChannelOpen(peer.clone()));
                self.engine.on_channel_open(&peer, channel).await;
            }
            NegotiationOutcome::Failed(peer, reason) => {
                self.emit(NodeEvent::ConnectionFailed {
                    peer: peer.clone(),
                    reason: reason.clone(),
                });
                self.engine.on_connection_failed(&peer, &reason).await;
            }
            NegotiationOutcome::None => {}
        }
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.event_tx.send(event);
    }
}

// ============================================================================
// TESTS
// ============================================================================
