//! Relay Server — rendezvous point that assigns session IDs and forwards
//! negotiation traffic between sessions. Holds no file data.

use super::protocol::{
    read_message, write_message, ClientMessage, ProtocolError, ServerMessage, SessionId,
    PROTOCOL_VERSION,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Address to bind the listener to
    pub bind_addr: String,
    /// Maximum concurrent sessions
    pub max_sessions: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            max_sessions: 1000,
        }
    }
}

/// Statistics about relay server operations
#[derive(Debug, Clone, Default)]
pub struct RelayServerStats {
    /// Number of live sessions
    pub sessions_active: usize,
    /// Total sessions accepted since start
    pub sessions_total: u64,
    /// Payloads forwarded to a live target
    pub messages_forwarded: u64,
    /// Payloads dropped because the target was not connected
    pub forwards_dropped: u64,
}

/// Relay server error types
#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("Bind failed: {0}")]
    BindFailed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One live session: the handle used to deliver messages to it
struct SessionEntry {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

/// The rendezvous server.
///
/// Sessions are registered on connect and removed on disconnect; forwarding
/// to an unknown target is a silent drop, never an error; senders detect
/// loss through the transfer-layer timeout.
pub struct RelayServer {
    config: RelayServerConfig,
    /// Live sessions. The one shared-mutation point in the server: touched
    /// by every connection task, so it sits behind a lock. Never held across
    /// an await.
    sessions: Arc<RwLock<HashMap<SessionId, SessionEntry>>>,
    stats: Arc<RwLock<RelayServerStats>>,
}

impl RelayServer {
    /// Create a new relay server with default configuration
    pub fn new() -> Self {
        Self::with_config(RelayServerConfig::default())
    }

    /// Create a new relay server with custom configuration
    pub fn with_config(config: RelayServerConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayServerStats::default())),
        }
    }

    /// Bind the listener and start accepting sessions.
    ///
    /// Returns the bound address (useful when the configured port is 0).
    /// The accept loop runs until the server is dropped or the process exits.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, RelayServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| RelayServerError::BindFailed(e.to_string()))?;
        let addr = listener.local_addr()?;
        info!(%addr, "relay server listening");

        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        if server.session_count() >= server.config.max_sessions {
                            warn!(%peer_addr, "session limit reached, refusing connection");
                            continue;
                        }
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            server.handle_session(stream, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        Ok(addr)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Get current server statistics
    pub fn stats(&self) -> RelayServerStats {
        self.stats.read().clone()
    }

    /// Drive one client session: register, serve, unregister, broadcast.
    async fn handle_session(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let session_id = SessionId::generate();
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

        {
            let mut sessions = self.sessions.write();
            sessions.insert(session_id.clone(), SessionEntry { tx: tx.clone() });
            let mut stats = self.stats.write();
            stats.sessions_active = sessions.len();
            stats.sessions_total += 1;
        }
        info!(session = %session_id, %peer_addr, "session connected");

        // Writer task: drain the delivery queue onto the socket
        let writer_session = session_id.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write_message(&mut writer, &message).await {
                    debug!(session = %writer_session, error = %e, "session write failed");
                    break;
                }
            }
        });

        // The assigned ID is the first thing the client hears
        let _ = tx.send(ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            session_id: session_id.clone(),
        });

        loop {
            let message: Result<ClientMessage, ProtocolError> = read_message(&mut reader).await;
            match message {
                Ok(ClientMessage::Discover) => {
                    let peers = self.other_sessions(&session_id);
                    debug!(session = %session_id, count = peers.len(), "discover");
                    let _ = tx.send(ServerMessage::PeerList { peers });
                }
                Ok(ClientMessage::Forward { target, payload }) => {
                    self.forward(&session_id, &target, payload);
                }
                Err(e) => {
                    debug!(session = %session_id, error = %e, "session read ended");
                    break;
                }
            }
        }

        self.remove_session(&session_id);
        writer_task.abort();
        info!(session = %session_id, "session disconnected");
    }

    /// All live session IDs except the caller's
    fn other_sessions(&self, caller: &SessionId) -> Vec<SessionId> {
        self.sessions
            .read()
            .keys()
            .filter(|id| *id != caller)
            .cloned()
            .collect()
    }

    /// Relay a payload to `target`, tagged with the sender's ID.
    ///
    /// A missing target is a no-op: the sender gets no confirmation either
    /// way and must rely on its own timeout.
    fn forward(
        &self,
        from: &SessionId,
        target: &SessionId,
        payload: super::protocol::ForwardPayload,
    ) {
        let kind = payload.kind();
        let delivered = {
            let sessions = self.sessions.read();
            match sessions.get(target) {
                Some(entry) => entry
                    .tx
                    .send(ServerMessage::Delivery {
                        from: from.clone(),
                        payload,
                    })
                    .is_ok(),
                None => false,
            }
        };

        let mut stats = self.stats.write();
        if delivered {
            stats.messages_forwarded += 1;
        } else {
            stats.forwards_dropped += 1;
            debug!(%from, %target, kind, "forward dropped, target not connected");
        }
    }

    /// Remove a session and broadcast its departure to everyone else
    fn remove_session(&self, session_id: &SessionId) {
        let remaining: Vec<mpsc::UnboundedSender<ServerMessage>> = {
            let mut sessions = self.sessions.write();
            if sessions.remove(session_id).is_none() {
                return;
            }
            let mut stats = self.stats.write();
            stats.sessions_active = sessions.len();
            sessions.values().map(|e| e.tx.clone()).collect()
        };

        for tx in remaining {
            let _ = tx.send(ServerMessage::PeerDisconnected {
                id: session_id.clone(),
            });
        }
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
