//! Relay wire protocol — messages and serialization for the rendezvous leg

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single relay frame. Anything larger terminates the
/// offending session; file bytes never travel over the relay leg.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Opaque session identifier assigned by the relay server.
///
/// Generated from 16 random bytes, hex encoded. Unique per connection
/// lifetime; carries no persistent identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh, unpredictable session ID
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata describing one file offered for transfer.
///
/// Advisory at request time; the `file-start` control message on the direct
/// channel carries the authoritative copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferMetadata {
    /// Declared file name (bare name, sanitized again on the receiving side)
    pub name: String,
    /// Declared size in bytes
    pub size: u64,
    /// Sender-computed SHA-256 digest, hex encoded, when pre-hashing is enabled
    pub hash: Option<String>,
    /// Source modification time, seconds since the Unix epoch
    pub modified: Option<u64>,
}

/// A connection-negotiation descriptor relayed between two sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Descriptor {
    /// Offer: the offerer has bound a listener and advertises its addresses
    Offer {
        /// Candidate socket addresses, in preference order
        candidates: Vec<String>,
    },
    /// Answer: the answerer is dialing the given candidate
    Answer {
        /// The candidate address selected for dialing
        address: String,
    },
    /// An additional candidate discovered after the offer was sent
    Candidate {
        /// Socket address to try in addition to the offer's candidates
        address: String,
    },
}

/// Payload kinds the relay server forwards between sessions.
///
/// The server never inspects these beyond routing; delivery is tagged with
/// the sender's session ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ForwardPayload {
    /// Connection-negotiation descriptor (offer/answer/candidate)
    Descriptor(Descriptor),
    /// Transfer request with advisory file metadata
    TransferRequest(TransferMetadata),
    /// Transfer response: accept or reject
    TransferResponse {
        /// Whether the recipient accepted the transfer
        accept: bool,
    },
}

impl ForwardPayload {
    /// Human-readable payload kind for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardPayload::Descriptor(Descriptor::Offer { .. }) => "descriptor/offer",
            ForwardPayload::Descriptor(Descriptor::Answer { .. }) => "descriptor/answer",
            ForwardPayload::Descriptor(Descriptor::Candidate { .. }) => "descriptor/candidate",
            ForwardPayload::TransferRequest(_) => "transfer-request",
            ForwardPayload::TransferResponse { .. } => "transfer-response",
        }
    }
}

/// Messages a client sends to the relay server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Request the current list of other live sessions
    Discover,
    /// Forward a payload to another session
    Forward {
        /// Target session ID
        target: SessionId,
        /// Payload to deliver
        payload: ForwardPayload,
    },
}

/// Messages the relay server sends to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// First message after connect: the assigned session ID
    Welcome {
        /// Protocol version the server speaks
        version: u32,
        /// The session ID assigned to this connection
        session_id: SessionId,
    },
    /// Response to Discover: all other live sessions
    PeerList {
        /// Session IDs, caller excluded, order irrelevant
        peers: Vec<SessionId>,
    },
    /// A payload forwarded from another session
    Delivery {
        /// Session ID of the sender
        from: SessionId,
        /// The forwarded payload
        payload: ForwardPayload,
    },
    /// Broadcast: a session disconnected
    PeerDisconnected {
        /// The session that went away
        id: SessionId,
    },
}

impl ServerMessage {
    /// Get a human-readable description of the message type
    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "Welcome",
            ServerMessage::PeerList { .. } => "PeerList",
            ServerMessage::Delivery { .. } => "Delivery",
            ServerMessage::PeerDisconnected { .. } => "PeerDisconnected",
        }
    }
}

impl ClientMessage {
    /// Get a human-readable description of the message type
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::Discover => "Discover",
            ClientMessage::Forward { .. } => "Forward",
        }
    }
}

/// Relay protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Frame length {0} exceeds limit")]
    FrameTooLarge(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialize and write one length-prefixed frame
pub async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let payload =
        bincode::serialize(message).map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and deserialize one length-prefixed frame
pub async fn read_message<R, M>(reader: &mut R) -> Result<M, ProtocolError>
where
    R: AsyncRead + Unpin,
    M: for<'de> Deserialize<'de>,
{
    let len = reader.read_u32().await? as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    bincode::deserialize(&buf).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================
