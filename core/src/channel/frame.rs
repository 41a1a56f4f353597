//! Frame codec for the direct peer channel.
//!
//! Two frame kinds share the wire: structured control messages (JSON) and
//! raw data chunks. Each frame is `kind (1 byte) + length (u32) + payload`,
//! which preserves the sender's per-call chunk boundaries — the protocol has
//! no internal length prefix of its own.

use crate::relay::SessionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const KIND_CONTROL: u8 = 0;
const KIND_DATA: u8 = 1;

/// Control frames stay small
pub const MAX_CONTROL_LEN: usize = 64 * 1024;
/// Data frames carry one chunk; cap well above any sane chunk size
pub const MAX_DATA_LEN: usize = 4 * 1024 * 1024;

/// Structured control messages exchanged on the direct channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Sent by the dialing side as its first frame to identify itself
    Hello {
        /// The dialer's relay session ID
        session_id: SessionId,
    },
    /// Announces the file about to be streamed; authoritative metadata
    FileStart {
        name: String,
        size: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        hash: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        modified: Option<u64>,
    },
    /// Receiver has allocated its destination and is ready for chunks
    FileReady,
    /// All chunks sent
    FileEnd,
    /// Abort the active transfer
    #[serde(rename = "error")]
    FileError { detail: String },
}

impl ControlMessage {
    /// Human-readable message type for logging
    pub fn message_type(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "hello",
            ControlMessage::FileStart { .. } => "file-start",
            ControlMessage::FileReady => "file-ready",
            ControlMessage::FileEnd => "file-end",
            ControlMessage::FileError { .. } => "error",
        }
    }
}

/// One frame on the direct channel
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A structured control message
    Control(ControlMessage),
    /// One raw chunk of file bytes
    Data(Vec<u8>),
}

/// Channel codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame length {0} exceeds limit")]
    FrameTooLarge(usize),
    #[error("Unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("Control codec error: {0}")]
    Codec(String),
}

/// Write one frame
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    match frame {
        Frame::Control(message) => {
            let payload =
                serde_json::to_vec(message).map_err(|e| FrameError::Codec(e.to_string()))?;
            if payload.len() > MAX_CONTROL_LEN {
                return Err(FrameError::FrameTooLarge(payload.len()));
            }
            writer.write_u8(KIND_CONTROL).await?;
            writer.write_u32(payload.len() as u32).await?;
            writer.write_all(&payload).await?;
        }
        Frame::Data(bytes) => {
            if bytes.len() > MAX_DATA_LEN {
                return Err(FrameError::FrameTooLarge(bytes.len()));
            }
            writer.write_u8(KIND_DATA).await?;
            writer.write_u32(bytes.len() as u32).await?;
            writer.write_all(bytes).await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Read one frame
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let kind = reader.read_u8().await?;
    let len = reader.read_u32().await? as usize;
    match kind {
        KIND_CONTROL => {
            if len == 0 || len > MAX_CONTROL_LEN {
                return Err(FrameError::FrameTooLarge(len));
            }
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            let message =
                serde_json::from_slice(&buf).map_err(|e| FrameError::Codec(e.to_string()))?;
            Ok(Frame::Control(message))
        }
        KIND_DATA => {
            if len > MAX_DATA_LEN {
                return Err(FrameError::FrameTooLarge(len));
            }
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            Ok(Frame::Data(buf))
        }
        other => Err(FrameError::UnknownKind(other)),
    }
}

// ============================================================================
// TESTS
// ============================================================================
