//! Transport seam for the PQDROP engine
//!
//! The engine never dials or listens: the hosting application hands it an
//! already-open bidirectional channel. NAT traversal, signaling, and
//! transport-level retransmission all live on the far side of this trait.

use crate::error::{Error, Result};
use crate::protocol::{
    decode_frame_header, decode_frame_payload, encode_frame, Message, FRAME_HEADER_LEN,
};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Bidirectional message channel supplied by the hosting application
#[async_trait]
pub trait Transport: Send {
    /// Send one protocol message
    async fn send(&mut self, message: Message) -> Result<()>;

    /// Receive the next protocol message; `None` means the peer closed
    async fn recv(&mut self) -> Result<Option<Message>>;
}

/// Frame codec over any ordered byte stream
pub struct FramedTransport<S> {
    io: S,
}

impl<S> FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already-open byte stream
    pub fn new(io: S) -> Self {
        Self { io }
    }

    /// Unwrap the underlying stream
    pub fn into_inner(self) -> S {
        self.io
    }
}

#[async_trait]
impl<S> Transport for FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: Message) -> Result<()> {
        let frame = encode_frame(&message)?;
        self.io.write_all(&frame).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Message>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match self.io.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let length = decode_frame_header(&header)?;
        let mut payload = vec![0u8; length];
        self.io.read_exact(&mut payload).await?;
        Ok(Some(decode_frame_payload(&payload)?))
    }
}

/// In-process transport backed by bounded channels
///
/// Used by tests and by hosting applications that run both legs locally.
pub struct MemoryTransport {
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
}

/// Create a connected pair of in-memory transports
pub fn memory_pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let (left_tx, right_rx) = mpsc::channel(capacity);
    let (right_tx, left_rx) = mpsc::channel(capacity);
    (
        MemoryTransport {
            tx: left_tx,
            rx: left_rx,
        },
        MemoryTransport {
            tx: right_tx,
            rx: right_rx,
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::Transport("peer closed".into()))
    }

    async fn recv(&mut self) -> Result<Option<Message>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_roundtrip() {
        let (mut left, mut right) = memory_pair(4);
        left.send(Message::Ack { index: 9 }).await.unwrap();
        assert_eq!(right.recv().await.unwrap(), Some(Message::Ack { index: 9 }));
    }

    #[tokio::test]
    async fn test_memory_pair_close() {
        let (left, mut right) = memory_pair(4);
        drop(left);
        assert_eq!(right.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_framed_transport_roundtrip() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut client = FramedTransport::new(client);
        let mut server = FramedTransport::new(server);

        client
            .send(Message::Complete { success: true })
            .await
            .unwrap();
        client.send(Message::Ack { index: 3 }).await.unwrap();

        assert_eq!(
            server.recv().await.unwrap(),
            Some(Message::Complete { success: true })
        );
        assert_eq!(server.recv().await.unwrap(), Some(Message::Ack { index: 3 }));

        drop(client);
        assert_eq!(server.recv().await.unwrap(), None);
    }
}
