//! Duplex message channel between the coordinator and one shard.
//!
//! The transport is swappable: a length-prefixed JSON frame stream over
//! TCP for real shard processes, or an in-process channel pair for
//! tests. Orchestration code only sees typed `send`/`recv`.
//!
//! Wire format of the socket transport: a 4-byte big-endian length
//! followed by a JSON-encoded message.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::{CommandFrame, WorkerReply};

/// Upper bound on a single control frame. Tensor payloads do not use
/// this channel, so frames stay small; anything larger is a protocol
/// violation.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer has gone away; for a shard channel this usually means
    /// the process crashed or was shut down.
    #[error("channel closed by peer")]
    Closed,

    #[error("frame of {0} bytes exceeds the control-channel limit")]
    Oversized(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A typed duplex channel sending `Out` and receiving `In`.
pub enum DuplexChannel<Out, In> {
    /// Framed stream to another process.
    Socket {
        stream: TcpStream,
        _marker: PhantomData<(Out, In)>,
    },

    /// In-process transport for tests.
    Local {
        tx: mpsc::UnboundedSender<Out>,
        rx: mpsc::UnboundedReceiver<In>,
    },
}

/// Coordinator-side channel to one shard.
pub type ManagerChannel = DuplexChannel<CommandFrame, WorkerReply>;

/// Shard-side channel back to the coordinator.
pub type ShardChannel = DuplexChannel<WorkerReply, CommandFrame>;

impl<Out, In> DuplexChannel<Out, In>
where
    Out: Serialize,
    In: DeserializeOwned,
{
    /// Wrap an established TCP stream.
    pub fn socket(stream: TcpStream) -> Self {
        Self::Socket {
            stream,
            _marker: PhantomData,
        }
    }

    /// Create a connected in-process channel pair; the second element
    /// is the peer endpoint with the directions reversed.
    pub fn local_pair() -> (DuplexChannel<Out, In>, DuplexChannel<In, Out>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            DuplexChannel::Local {
                tx: out_tx,
                rx: in_rx,
            },
            DuplexChannel::Local {
                tx: in_tx,
                rx: out_rx,
            },
        )
    }

    /// Send one message. Does not wait for any reply.
    pub async fn send(&mut self, msg: Out) -> Result<(), ChannelError> {
        match self {
            Self::Socket { stream, .. } => {
                let payload = serde_json::to_vec(&msg)?;
                if payload.len() > MAX_FRAME_BYTES {
                    return Err(ChannelError::Oversized(payload.len()));
                }
                stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
                stream.write_all(&payload).await?;
                stream.flush().await?;
                Ok(())
            }
            Self::Local { tx, .. } => tx.send(msg).map_err(|_| ChannelError::Closed),
        }
    }

    /// Receive the next message, waiting until one arrives or the peer
    /// disconnects.
    pub async fn recv(&mut self) -> Result<In, ChannelError> {
        match self {
            Self::Socket { stream, .. } => {
                let mut len_buf = [0u8; 4];
                if let Err(err) = stream.read_exact(&mut len_buf).await {
                    if err.kind() == std::io::ErrorKind::UnexpectedEof {
                        return Err(ChannelError::Closed);
                    }
                    return Err(err.into());
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                if len > MAX_FRAME_BYTES {
                    return Err(ChannelError::Oversized(len));
                }
                let mut payload = vec![0u8; len];
                stream.read_exact(&mut payload).await?;
                Ok(serde_json::from_slice(&payload)?)
            }
            Self::Local { rx, .. } => rx.recv().await.ok_or(ChannelError::Closed),
        }
    }
}
