//! Frame writers and the socket listener.
//!
//! Both transports hand encoded blocks to a [`FramedWriter`]: the socket path
//! writes them straight to the TCP stream, the HTTP path forwards each one as
//! a body chunk through a capacity-1 channel.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use bsml_core::CodecError;

use crate::session::{StreamContext, StreamSession};

/// Sink for encoded blocks. One call, one self-delimiting frame.
pub trait FramedWriter: Send {
    fn write_frame(&mut self, frame: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Writes frames to a byte stream, flushing after each.
pub struct SocketWriter<W> {
    inner: W,
}

impl<W> SocketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin + Send> FramedWriter for SocketWriter<W> {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Body chunk item for a streaming HTTP response.
pub type BodyChunk = Result<Bytes, std::io::Error>;

/// Sends frames as HTTP body chunks. The channel holds one chunk, so the
/// producer runs at most one block ahead of the client.
pub struct ChunkWriter {
    tx: mpsc::Sender<BodyChunk>,
}

impl ChunkWriter {
    pub fn channel() -> (Self, mpsc::Receiver<BodyChunk>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }
}

impl FramedWriter for ChunkWriter {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.tx.send(Ok(frame)).await.map_err(|_| TransportError::Closed)
    }
}

// ── Listener ──────────────────────────────────────────────────────────────────

/// Accept block-protocol connections until shutdown. One task per connection.
pub async fn serve_connections(
    listener: TcpListener,
    ctx: Arc<StreamContext>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), TransportError> {
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "socket listener started");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    tracing::debug!(peer = %peer, "connection opened");
                    let (read, write) = stream.into_split();
                    let session = StreamSession::new(ctx, SocketWriter::new(write));
                    match session.run(read).await {
                        Ok(()) => tracing::debug!(peer = %peer, "connection closed"),
                        Err(e) => tracing::debug!(peer = %peer, error = %e, "connection ended"),
                    }
                });
            }
            _ = shutdown.recv() => {
                tracing::info!("socket listener shutting down");
                return Ok(());
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer went away")]
    Closed,

    #[error("encode failed: {0}")]
    Codec(#[from] CodecError),
}
