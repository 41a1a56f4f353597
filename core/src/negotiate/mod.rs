//! Connection Negotiator — establishes a direct channel to a peer via an
//! offer/answer/candidate exchange relayed through the rendezvous server.
//!
//! The offering side binds a listener and advertises its addresses as
//! candidates; the answering side dials candidates in order and identifies
//! itself with a `hello` frame. The accepted, identified socket is the open
//! channel. When both sides initiate at once, the side with the
//! lexicographically lower session ID stays the offerer and the other side
//! abandons its attempt and answers.

use crate::channel::{frame, spawn_channel, ChannelEvent, ChannelHandle, ControlMessage, Frame};
use crate::relay::{Descriptor, ForwardPayload, RelayClient, SessionId};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Per-candidate dial timeout
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// How long the offerer waits for the dialer's hello frame
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Negotiation errors
#[derive(Debug, Error)]
pub enum NegotiateError {
    #[error("Listener bind failed: {0}")]
    BindFailed(String),
    #[error("Offer carried no candidates")]
    NoCandidates,
}

/// State of one peer's negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Descriptor exchange in progress
    Negotiating,
    /// Channel established
    Open,
    /// This attempt failed; a later initiate may retry
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offerer,
    Answerer,
}

/// Signals from negotiation tasks back into the owning event loop
#[derive(Debug)]
pub enum NegotiateSignal {
    /// The offerer's listener accepted an identified connection
    Accepted {
        peer: SessionId,
        generation: u64,
        stream: TcpStream,
    },
    /// The answerer's dial succeeded and hello was sent
    Dialed {
        peer: SessionId,
        generation: u64,
        stream: TcpStream,
    },
    /// The attempt failed
    Failed {
        peer: SessionId,
        generation: u64,
        reason: String,
    },
    /// The attempt exceeded the negotiation timeout
    TimedOut { peer: SessionId, generation: u64 },
}

/// What applying a signal meant for the caller
#[derive(Debug)]
pub enum NegotiationOutcome {
    /// A channel opened to the peer
    Opened(SessionId, ChannelHandle),
    /// The peer's negotiation failed
    Failed(SessionId, String),
    /// Stale or irrelevant signal
    None,
}

struct Negotiation {
    state: NegotiationState,
    role: Role,
    generation: u64,
    task: Option<tokio::task::JoinHandle<()>>,
    /// Late candidates are fed to the answerer's dial task
    candidate_tx: Option<mpsc::UnboundedSender<String>>,
    channel: Option<ChannelHandle>,
}

/// Per-peer negotiation bookkeeping.
///
/// Owned by the node's event loop; all mutation happens on that loop. The
/// spawned listener/dial tasks communicate only through [`NegotiateSignal`]s.
pub struct Negotiator {
    local_id: SessionId,
    bind_addr: String,
    advertise_host: Option<String>,
    negotiation_timeout: Duration,
    relay: RelayClient,
    signal_tx: mpsc::UnboundedSender<NegotiateSignal>,
    channel_events: mpsc::UnboundedSender<(SessionId, ChannelEvent)>,
    records: HashMap<SessionId, Negotiation>,
    next_generation: u64,
}

impl Negotiator {
    pub fn new(
        local_id: SessionId,
        bind_addr: String,
        advertise_host: Option<String>,
        negotiation_timeout: Duration,
        relay: RelayClient,
        signal_tx: mpsc::UnboundedSender<NegotiateSignal>,
        channel_events: mpsc::UnboundedSender<(SessionId, ChannelEvent)>,
    ) -> Self {
        Self {
            local_id,
            bind_addr,
            advertise_host,
            negotiation_timeout,
            relay,
            signal_tx,
            channel_events,
            records: HashMap::new(),
            next_generation: 0,
        }
    }

    /// The open channel to a peer, when there is one
    pub fn channel(&self, peer: &SessionId) -> Option<ChannelHandle> {
        self.records
            .get(peer)
            .filter(|r| r.state == NegotiationState::Open)
            .and_then(|r| r.channel.clone())
    }

    /// Current negotiation state for a peer
    pub fn state(&self, peer: &SessionId) -> Option<NegotiationState> {
        self.records.get(peer).map(|r| r.state)
    }

    /// Start negotiating a channel to `peer` as the offering side.
    ///
    /// No-op when a negotiation is already running or a channel is open.
    pub async fn initiate(&mut self, peer: SessionId) {
        if let Some(record) = self.records.get(&peer) {
            match record.state {
                NegotiationState::Negotiating | NegotiationState::Open => {
                    debug!(%peer, state = ?record.state, "initiate is a no-op");
                    return;
                }
                NegotiationState::Failed => {}
            }
        }

        let generation = self.bump_generation();
        let listener = match TcpListener::bind(&self.bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!(%peer, error = %e, "listener bind failed");
                self.records.insert(
                    peer.clone(),
                    failed_record(Role::Offerer, generation),
                );
                let _ = self.signal_tx.send(NegotiateSignal::Failed {
                    peer,
                    generation,
                    reason: NegotiateError::BindFailed(e.to_string()).to_string(),
                });
                return;
            }
        };

        let candidates = match listener.local_addr() {
            Ok(addr) => vec![self.advertised_address(addr)],
            Err(e) => {
                warn!(%peer, error = %e, "listener address unavailable");
                self.records
                    .insert(peer.clone(), failed_record(Role::Offerer, generation));
                let _ = self.signal_tx.send(NegotiateSignal::Failed {
                    peer,
                    generation,
                    reason: format!("listener address unavailable: {}", e),
                });
                return;
            }
        };

        debug!(%peer, ?candidates, "sending offer");
        self.relay.forward(
            peer.clone(),
            ForwardPayload::Descriptor(Descriptor::Offer {
                candidates: candidates.clone(),
            }),
        );

        let task = tokio::spawn(accept_task(
            listener,
            peer.clone(),
            generation,
            self.negotiation_timeout,
            self.signal_tx.clone(),
        ));

        self.records.insert(
            peer,
            Negotiation {
                state: NegotiationState::Negotiating,
                role: Role::Offerer,
                generation,
                task: Some(task),
                candidate_tx: None,
                channel: None,
            },
        );
    }

    /// Apply an incoming descriptor from `from`.
    ///
    /// Offers are answered (creating a record when none exists); answers are
    /// applied; candidates are routed to [`Negotiator::handle_candidate`].
    pub fn handle_descriptor(&mut self, from: SessionId, descriptor: Descriptor) {
        match descriptor {
            Descriptor::Offer { candidates } => self.handle_offer(from, candidates),
            Descriptor::Answer { address } => {
                match self.records.get(&from) {
                    Some(record)
                        if record.role == Role::Offerer
                            && record.state == NegotiationState::Negotiating =>
                    {
                        debug!(peer = %from, %address, "answer applied, awaiting dial");
                    }
                    _ => debug!(peer = %from, "answer without matching offer, ignored"),
                }
            }
            Descriptor::Candidate { address } => self.handle_candidate(from, address),
        }
    }

    /// Apply an additional candidate. Candidates may race ahead of the
    /// descriptor that creates the record; that is not an error.
    pub fn handle_candidate(&mut self, from: SessionId, address: String) {
        match self.records.get(&from) {
            Some(record) => {
                if let Some(tx) = &record.candidate_tx {
                    let _ = tx.send(address);
                }
            }
            None => {
                debug!(peer = %from, "candidate before descriptor, ignored");
            }
        }
    }

    fn handle_offer(&mut self, from: SessionId, candidates: Vec<String>) {
        if let Some(record) = self.records.get(&from) {
            match (record.state, record.role) {
                (NegotiationState::Open, _) => {
                    debug!(peer = %from, "offer while channel open, ignored");
                    return;
                }
                (NegotiationState::Negotiating, Role::Offerer) => {
                    // Glare: both sides offered. Lower session ID keeps its
                    // listener; the other side answers instead.
                    if self.local_id < from {
                        debug!(peer = %from, "glare resolved, staying offerer");
                        return;
                    }
                    debug!(peer = %from, "glare resolved, abandoning offer to answer");
                    self.abort_record(&from);
                }
                (NegotiationState::Negotiating, Role::Answerer) => {
                    debug!(peer = %from, "duplicate offer, ignored");
                    return;
                }
                (NegotiationState::Failed, _) => {
                    // A fresh offer supersedes a failed attempt
                }
            }
        }

        let generation = self.bump_generation();
        if candidates.is_empty() {
            warn!(peer = %from, "offer carried no candidates");
            self.records
                .insert(from.clone(), failed_record(Role::Answerer, generation));
            let _ = self.signal_tx.send(NegotiateSignal::Failed {
                peer: from,
                generation,
                reason: NegotiateError::NoCandidates.to_string(),
            });
            return;
        }

        // Tell the offerer which address we are dialing first
        self.relay.forward(
            from.clone(),
            ForwardPayload::Descriptor(Descriptor::Answer {
                address: candidates[0].clone(),
            }),
        );

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(dial_task(
            candidates,
            candidate_rx,
            from.clone(),
            self.local_id.clone(),
            generation,
            self.negotiation_timeout,
            self.signal_tx.clone(),
        ));

        self.records.insert(
            from,
            Negotiation {
                state: NegotiationState::Negotiating,
                role: Role::Answerer,
                generation,
                task: Some(task),
                candidate_tx: Some(candidate_tx),
                channel: None,
            },
        );
    }

    /// Apply a signal from a negotiation task.
    ///
    /// Stale signals (superseded generation, no record) are dropped along
    /// with any stream they carry.
    pub fn apply_signal(&mut self, signal: NegotiateSignal) -> NegotiationOutcome {
        match signal {
            NegotiateSignal::Accepted {
                peer,
                generation,
                stream,
            }
            | NegotiateSignal::Dialed {
                peer,
                generation,
                stream,
            } => {
                let current = match self.records.get_mut(&peer) {
                    Some(record)
                        if record.generation == generation
                            && record.state == NegotiationState::Negotiating =>
                    {
                        record
                    }
                    _ => {
                        debug!(%peer, generation, "stale negotiation stream dropped");
                        return NegotiationOutcome::None;
                    }
                };
                let handle = spawn_channel(peer.clone(), stream, self.channel_events.clone());
                current.state = NegotiationState::Open;
                current.channel = Some(handle.clone());
                current.task = None;
                current.candidate_tx = None;
                info!(%peer, "direct channel open");
                NegotiationOutcome::Opened(peer, handle)
            }
            NegotiateSignal::Failed {
                peer,
                generation,
                reason,
            } => self.fail_record(peer, generation, reason),
            NegotiateSignal::TimedOut { peer, generation } => {
                self.fail_record(peer, generation, "negotiation timed out".to_string())
            }
        }
    }

    /// The peer's channel closed: drop its record so a later initiate can
    /// start fresh. Returns true when a record existed.
    pub fn handle_channel_closed(&mut self, peer: &SessionId) -> bool {
        match self.records.remove(peer) {
            Some(record) => {
                if let Some(task) = record.task {
                    task.abort();
                }
                info!(%peer, "direct channel closed");
                true
            }
            None => false,
        }
    }

    /// Tear down everything for a peer (relay-level disconnect)
    pub fn teardown(&mut self, peer: &SessionId) {
        if let Some(record) = self.records.remove(peer) {
            if let Some(task) = record.task {
                task.abort();
            }
            debug!(%peer, "negotiation torn down");
        }
    }

    fn fail_record(
        &mut self,
        peer: SessionId,
        generation: u64,
        reason: String,
    ) -> NegotiationOutcome {
        match self.records.get_mut(&peer) {
            Some(record)
                if record.generation == generation
                    && record.state == NegotiationState::Negotiating =>
            {
                record.state = NegotiationState::Failed;
                record.task = None;
                record.candidate_tx = None;
                warn!(%peer, %reason, "negotiation failed");
                NegotiationOutcome::Failed(peer, reason)
            }
            _ => NegotiationOutcome::None,
        }
    }

    fn abort_record(&mut self, peer: &SessionId) {
        if let Some(record) = self.records.remove(peer) {
            if let Some(task) = record.task {
                task.abort();
            }
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn advertised_address(&self, bound: std::net::SocketAddr) -> String {
        match &self.advertise_host {
            Some(host) => format!("{}:{}", host, bound.port()),
            // A wildcard bind is not dialable; fall back to loopback
            None if bound.ip().is_unspecified() => format!("127.0.0.1:{}", bound.port()),
            None => bound.to_string(),
        }
    }
}

fn failed_record(role: Role, generation: u64) -> Negotiation {
    Negotiation {
        state: NegotiationState::Failed,
        role,
        generation,
        task: None,
        candidate_tx: None,
        channel: None,
    }
}

/// Offerer side: wait for the answerer to dial in and identify itself
async fn accept_task(
    listener: TcpListener,
    peer: SessionId,
    generation: u64,
    negotiation_timeout: Duration,
    signal_tx: mpsc::UnboundedSender<NegotiateSignal>,
) {
    let accept_loop = async {
        loop {
            let (mut stream, remote) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => return Err(format!("accept failed: {}", e)),
            };
            // The dialer must identify as the peer we offered to; anything
            // else gets dropped and the listener keeps waiting.
            match timeout(HELLO_TIMEOUT, frame::read_frame(&mut stream)).await {
                Ok(Ok(Frame::Control(ControlMessage::Hello { session_id })))
                    if session_id == peer =>
                {
                    return Ok(stream);
                }
                Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                    debug!(%peer, %remote, "unidentified connection dropped");
                    continue;
                }
            }
        }
    };

    match timeout(negotiation_timeout, accept_loop).await {
        Ok(Ok(stream)) => {
            let _ = signal_tx.send(NegotiateSignal::Accepted {
                peer,
                generation,
                stream,
            });
        }
        Ok(Err(reason)) => {
            let _ = signal_tx.send(NegotiateSignal::Failed {
                peer,
                generation,
                reason,
            });
        }
        Err(_) => {
            let _ = signal_tx.send(NegotiateSignal::TimedOut { peer, generation });
        }
    }
}

/// Answerer side: dial candidates in order, then any late ones, and send
/// hello on the first socket that connects
async fn dial_task(
    candidates: Vec<String>,
    mut late: mpsc::UnboundedReceiver<String>,
    peer: SessionId,
    local_id: SessionId,
    generation: u64,
    negotiation_timeout: Duration,
    signal_tx: mpsc::UnboundedSender<NegotiateSignal>,
) {
    let dial_loop = async {
        for address in candidates {
            if let Some(stream) = try_dial(&address, &local_id).await {
                return Ok(stream);
            }
        }
        while let Some(address) = late.recv().await {
            if let Some(stream) = try_dial(&address, &local_id).await {
                return Ok(stream);
            }
        }
        Err("all candidates failed".to_string())
    };

    match timeout(negotiation_timeout, dial_loop).await {
        Ok(Ok(stream)) => {
            let _ = signal_tx.send(NegotiateSignal::Dialed {
                peer,
                generation,
                stream,
            });
        }
        Ok(Err(reason)) => {
            let _ = signal_tx.send(NegotiateSignal::Failed {
                peer,
                generation,
                reason,
            });
        }
        Err(_) => {
            let _ = signal_tx.send(NegotiateSignal::TimedOut { peer, generation });
        }
    }
}

async fn try_dial(address: &str, local_id: &SessionId) -> Option<TcpStream> {
    match timeout(DIAL_TIMEOUT, TcpStream::connect(address)).await {
        Ok(Ok(mut stream)) => {
            let hello = Frame::Control(ControlMessage::Hello {
                session_id: local_id.clone(),
            });
            match frame::write_frame(&mut stream, &hello).await {
                Ok(()) => Some(stream),
                Err(e) => {
                    debug!(%address, error = %e, "hello write failed");
                    None
                }
            }
        }
        Ok(Err(e)) => {
            debug!(%address, error = %e, "candidate dial failed");
            None
        }
        Err(_) => {
            debug!(%address, "candidate dial timed out");
            None
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
