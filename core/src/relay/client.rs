//! Discovery Client — maintains the connection to the relay server, tracks
//! the assigned session ID, and surfaces deliveries as typed events.

use super::protocol::{
    read_message, write_message, ClientMessage, ForwardPayload, ProtocolError, ServerMessage,
    SessionId,
};
use super::socks;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Relay client configuration
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Rendezvous server address, `host:port` (an onion host when proxied)
    pub server_addr: String,
    /// Local SOCKS5 proxy endpoint; direct connection when absent
    pub socks_proxy: Option<String>,
    /// Interval between periodic discovery requests
    pub discovery_interval: Duration,
    /// Initial connection attempts before giving up
    pub connect_retries: u32,
    /// Base delay between connection attempts (doubles per attempt)
    pub retry_delay: Duration,
    /// How long to wait for the server's Welcome
    pub welcome_timeout: Duration,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:3000".to_string(),
            socks_proxy: None,
            discovery_interval: Duration::from_secs(5),
            connect_retries: 3,
            retry_delay: Duration::from_secs(2),
            welcome_timeout: Duration::from_secs(10),
        }
    }
}

/// Events surfaced from the relay connection
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A discovery response: the full current peer set
    PeerList(Vec<SessionId>),
    /// A payload forwarded from another session
    Delivery {
        /// The sending session
        from: SessionId,
        /// The forwarded payload
        payload: ForwardPayload,
    },
    /// Another session disconnected from the relay
    PeerDisconnected(SessionId),
    /// Our own relay connection is gone
    Disconnected,
}

/// Relay client error types
#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("Invalid server address: {0}")]
    InvalidAddress(String),
    #[error("Connection failed after {attempts} attempts: {last}")]
    ConnectFailed { attempts: u32, last: String },
    #[error("Proxy error: {0}")]
    Proxy(#[from] socks::SocksError),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Handle to a live relay connection.
///
/// Cheap to clone; all clones feed the same outbound queue. Dropping every
/// clone closes the connection.
#[derive(Clone)]
pub struct RelayClient {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl RelayClient {
    /// Connect to the relay server and complete the Welcome handshake.
    ///
    /// Retries with exponential backoff, then reads the assigned session ID
    /// and spawns the reader/writer/discovery tasks. Returns the handle and
    /// the event stream.
    pub async fn connect(
        config: RelayClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RelayEvent>), RelayClientError> {
        let mut stream = dial_with_retries(&config).await?;

        let welcome: ServerMessage = timeout(config.welcome_timeout, read_message(&mut stream))
            .await
            .map_err(|_| RelayClientError::HandshakeFailed("welcome timed out".to_string()))??;
        let session_id = match welcome {
            ServerMessage::Welcome { session_id, .. } => session_id,
            other => {
                return Err(RelayClientError::HandshakeFailed(format!(
                    "expected Welcome, got {}",
                    other.message_type()
                )))
            }
        };
        info!(session = %session_id, server = %config.server_addr, "connected to relay");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<RelayEvent>();
        let (mut reader, mut writer) = stream.into_split();

        // Writer: drain the outbound queue
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = write_message(&mut writer, &message).await {
                    debug!(error = %e, "relay write failed");
                    break;
                }
            }
        });

        // Reader: decode deliveries into events until the connection dies
        let reader_events = event_tx.clone();
        tokio::spawn(async move {
            loop {
                let message: Result<ServerMessage, ProtocolError> =
                    read_message(&mut reader).await;
                let event = match message {
                    Ok(ServerMessage::PeerList { peers }) => RelayEvent::PeerList(peers),
                    Ok(ServerMessage::Delivery { from, payload }) => {
                        RelayEvent::Delivery { from, payload }
                    }
                    Ok(ServerMessage::PeerDisconnected { id }) => RelayEvent::PeerDisconnected(id),
                    Ok(ServerMessage::Welcome { .. }) => continue,
                    Err(e) => {
                        warn!(error = %e, "relay connection lost");
                        let _ = reader_events.send(RelayEvent::Disconnected);
                        break;
                    }
                };
                if reader_events.send(event).is_ok() {
                    continue;
                }
                break;
            }
        });

        // Periodic discovery; the first tick fires immediately
        let discover_tx = out_tx.clone();
        let interval = config.discovery_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if discover_tx.send(ClientMessage::Discover).is_err() {
                    break;
                }
            }
        });

        Ok((
            Self {
                session_id,
                tx: out_tx,
            },
            event_rx,
        ))
    }

    /// The session ID the relay assigned to us
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Request a fresh peer list
    pub fn discover(&self) {
        let _ = self.tx.send(ClientMessage::Discover);
    }

    /// Forward a payload to another session via the relay
    pub fn forward(&self, target: SessionId, payload: ForwardPayload) {
        let _ = self.tx.send(ClientMessage::Forward { target, payload });
    }

    /// Build a client around an existing outbound queue (tests and wiring)
    pub(crate) fn from_parts(
        session_id: SessionId,
        tx: mpsc::UnboundedSender<ClientMessage>,
    ) -> Self {
        Self { session_id, tx }
    }
}

/// Dial the server, through the proxy when configured, with backoff
async fn dial_with_retries(config: &RelayClientConfig) -> Result<TcpStream, RelayClientError> {
    let attempts = config.connect_retries.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = backoff_duration(config.retry_delay, attempt);
            debug!(attempt, ?delay, "retrying relay connection");
            tokio::time::sleep(delay).await;
        }

        let result = match &config.socks_proxy {
            Some(proxy) => {
                let (host, port) = split_host_port(&config.server_addr)?;
                socks::connect(proxy, host, port).await.map_err(|e| e.to_string())
            }
            None => TcpStream::connect(&config.server_addr)
                .await
                .map_err(|e| e.to_string()),
        };

        match result {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!(attempt = attempt + 1, error = %e, "relay connection attempt failed");
                last_error = e;
            }
        }
    }

    Err(RelayClientError::ConnectFailed {
        attempts,
        last: last_error,
    })
}

/// Exponential backoff capped at one minute
fn backoff_duration(base: Duration, attempt: u32) -> Duration {
    let backoff_ms = (base.as_millis() as u64) * (2u64.pow(attempt.min(5)));
    Duration::from_millis(backoff_ms.min(60_000))
}

fn split_host_port(addr: &str) -> Result<(&str, u16), RelayClientError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| RelayClientError::InvalidAddress(addr.to_string()))?;
    let port = port
        .parse()
        .map_err(|_| RelayClientError::InvalidAddress(addr.to_string()))?;
    Ok((host, port))
}

// ============================================================================
// TESTS
// ============================================================================
