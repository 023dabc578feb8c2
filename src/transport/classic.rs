//! Connection-oriented classic link.
//!
//! Carries envelope bodies as u32 big-endian length-prefixed frames over any
//! duplex byte stream. The stream type is generic so production sockets and
//! in-process duplex pipes share one implementation.

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::{Error, Result};
use crate::protocol::{DeviceAddress, MAX_FRAME_LEN};

use super::{LinkReader, LinkSession, LinkWriter, TransportKind};

/// A classic session over a duplex stream.
pub struct ClassicLink<S> {
    peer: DeviceAddress,
    stream: S,
}

impl<S> ClassicLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(peer: DeviceAddress, stream: S) -> Self {
        Self { peer, stream }
    }

    pub fn peer(&self) -> &DeviceAddress {
        &self.peer
    }
}

impl<S> LinkSession for ClassicLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn kind(&self) -> TransportKind {
        TransportKind::Classic
    }

    fn split(self: Box<Self>) -> (Box<dyn LinkWriter>, Box<dyn LinkReader>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            Box::new(ClassicWriter {
                peer: self.peer.clone(),
                stream: write,
                closed: false,
            }),
            Box::new(ClassicReader {
                peer: self.peer,
                stream: read,
            }),
        )
    }
}

/// Outbound half of a classic link.
pub struct ClassicWriter<S> {
    peer: DeviceAddress,
    stream: WriteHalf<S>,
    closed: bool,
}

#[async_trait]
impl<S> LinkWriter for ClassicWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        if self.closed {
            return Err(Error::Transport(format!("link to {} is closed", self.peer)));
        }
        if frame.len() > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                frame.len(),
                MAX_FRAME_LEN
            )));
        }

        let mut header = [0u8; 4];
        BigEndian::write_u32(&mut header, frame.len() as u32);
        self.stream.write_all(&header).await?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.stream.shutdown().await?;
        }
        Ok(())
    }
}

/// Inbound half of a classic link.
pub struct ClassicReader<S> {
    peer: DeviceAddress,
    stream: ReadHalf<S>,
}

#[async_trait]
impl<S> LinkReader for ClassicReader<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        let mut header = [0u8; 4];
        match self.stream.read_exact(&mut header).await {
            Ok(_) => {}
            // A clean close lands between frames.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = BigEndian::read_u32(&header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "peer {} announced a frame of {} bytes",
                self.peer, len
            )));
        }

        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        Ok(Some(Bytes::from(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_pair() -> (
        (Box<dyn LinkWriter>, Box<dyn LinkReader>),
        (Box<dyn LinkWriter>, Box<dyn LinkReader>),
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let a: Box<dyn LinkSession> = Box::new(ClassicLink::new("AA:BB:CC:DD:EE:01".into(), a));
        let b: Box<dyn LinkSession> = Box::new(ClassicLink::new("AA:BB:CC:DD:EE:02".into(), b));
        (a.split(), b.split())
    }

    #[tokio::test]
    async fn frames_cross_the_stream_in_order() {
        let ((mut a_tx, _a_rx), (_b_tx, mut b_rx)) = split_pair();
        a_tx.send(Bytes::from_static(b"first")).await.unwrap();
        a_tx.send(Bytes::from_static(b"second")).await.unwrap();

        assert_eq!(b_rx.recv().await.unwrap().unwrap(), "first");
        assert_eq!(b_rx.recv().await.unwrap().unwrap(), "second");
    }

    #[tokio::test]
    async fn remote_close_ends_the_frame_stream() {
        let ((mut a_tx, _a_rx), (_b_tx, mut b_rx)) = split_pair();
        a_tx.close().await.unwrap();
        assert!(b_rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected_before_the_wire() {
        let ((mut a_tx, _a_rx), _) = split_pair();
        let huge = Bytes::from(vec![0u8; MAX_FRAME_LEN + 1]);
        assert!(matches!(a_tx.send(huge).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn oversized_announcements_are_a_protocol_error() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let session: Box<dyn LinkSession> =
            Box::new(ClassicLink::new("AA:BB:CC:DD:EE:02".into(), b));
        let (_b_tx, mut b_rx) = session.split();

        let mut raw = a;
        let mut header = [0u8; 4];
        BigEndian::write_u32(&mut header, (MAX_FRAME_LEN + 1) as u32);
        raw.write_all(&header).await.unwrap();
        raw.flush().await.unwrap();

        assert!(matches!(b_rx.recv().await, Err(Error::Protocol(_))));
    }
}
