//! Direct peer channel — a framed TCP connection owned by a channel task.
//!
//! The task owns the socket; everything else talks to it through a
//! [`ChannelHandle`] (outbound) and the shared channel-event queue (inbound).
//! Messages on one channel are delivered in send order; nothing is promised
//! across channels.

pub mod frame;

pub use frame::{ControlMessage, Frame, FrameError};

use crate::relay::SessionId;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound queue depth. The chunk pacing delay keeps the queue shallow in
/// practice; a full queue means the channel has stalled.
const OUTBOUND_CAPACITY: usize = 64;

/// Events produced by a channel task
#[derive(Debug)]
pub enum ChannelEvent {
    /// A control message arrived
    Control(ControlMessage),
    /// A data chunk arrived
    Data(Vec<u8>),
    /// The channel closed (remote close or I/O error)
    Closed,
}

/// Commands accepted by a channel task
#[derive(Debug)]
enum ChannelCommand {
    Control(ControlMessage),
    Data(Vec<u8>),
}

/// Channel send errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel to peer is closed")]
    Closed,
    #[error("Channel to peer is stalled")]
    Stalled,
}

/// Handle for sending frames to one peer's channel task
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    peer: SessionId,
    tx: mpsc::Sender<ChannelCommand>,
}

impl ChannelHandle {
    /// The peer this channel reaches
    pub fn peer(&self) -> &SessionId {
        &self.peer
    }

    /// Queue a control message without waiting.
    ///
    /// Fails when the channel is closed or its outbound queue is full; the
    /// latter only happens when the peer has stopped draining the socket.
    pub fn try_control(&self, message: ControlMessage) -> Result<(), ChannelError> {
        self.tx
            .try_send(ChannelCommand::Control(message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
                mpsc::error::TrySendError::Full(_) => ChannelError::Stalled,
            })
    }

    /// Queue a control message, waiting for queue space
    pub async fn send_control(&self, message: ControlMessage) -> Result<(), ChannelError> {
        self.tx
            .send(ChannelCommand::Control(message))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Queue one data chunk, waiting for queue space
    pub async fn send_data(&self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        self.tx
            .send(ChannelCommand::Data(bytes))
            .await
            .map_err(|_| ChannelError::Closed)
    }

}

/// Take ownership of an established socket and run it as a channel.
///
/// Inbound frames are forwarded to `events` tagged with the peer ID; a
/// single `Closed` event marks the end of the stream. The returned handle
/// feeds the outbound half.
pub fn spawn_channel(
    peer: SessionId,
    stream: TcpStream,
    events: mpsc::UnboundedSender<(SessionId, ChannelEvent)>,
) -> ChannelHandle {
    let (tx, mut rx) = mpsc::channel::<ChannelCommand>(OUTBOUND_CAPACITY);
    let (mut reader, mut writer) = stream.into_split();

    let writer_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let frame = match command {
                ChannelCommand::Control(message) => Frame::Control(message),
                ChannelCommand::Data(bytes) => Frame::Data(bytes),
            };
            if let Err(e) = frame::write_frame(&mut writer, &frame).await {
                debug!(peer = %writer_peer, error = %e, "channel write failed");
                break;
            }
        }
        // Dropping the write half sends FIN; the peer's reader sees EOF
    });

    let reader_peer = peer.clone();
    tokio::spawn(async move {
        loop {
            match frame::read_frame(&mut reader).await {
                Ok(Frame::Control(message)) => {
                    if events
                        .send((reader_peer.clone(), ChannelEvent::Control(message)))
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(Frame::Data(bytes)) => {
                    if events
                        .send((reader_peer.clone(), ChannelEvent::Data(bytes)))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    debug!(peer = %reader_peer, error = %e, "channel closed");
                    let _ = events.send((reader_peer.clone(), ChannelEvent::Closed));
                    break;
                }
            }
        }
    });

    ChannelHandle { peer, tx }
}

// ============================================================================
// TESTS
// ============================================================================
