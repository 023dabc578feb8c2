//! Advertisement-based low-energy link.
//!
//! The low-energy transport has no persistent socket; its native connection
//! primitive is modeled as a bounded bidirectional frame channel, one whole
//! envelope per exchange. Lighter weight than a classic session: no stream
//! framing, no handshake beyond channel creation.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::DeviceAddress;

use super::{LinkReader, LinkSession, LinkWriter, TransportKind};

/// Depth of the per-direction frame channel.
const LE_CHANNEL_DEPTH: usize = 16;

/// A low-energy session backed by a paired frame channel.
pub struct LeLink {
    peer: DeviceAddress,
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

impl LeLink {
    /// Create both ends of a low-energy link. Each end names the device it
    /// talks to.
    pub fn pair(a_peer: DeviceAddress, b_peer: DeviceAddress) -> (LeLink, LeLink) {
        let (a_tx, b_rx) = mpsc::channel(LE_CHANNEL_DEPTH);
        let (b_tx, a_rx) = mpsc::channel(LE_CHANNEL_DEPTH);
        (
            LeLink {
                peer: a_peer,
                tx: a_tx,
                rx: a_rx,
            },
            LeLink {
                peer: b_peer,
                tx: b_tx,
                rx: b_rx,
            },
        )
    }

    pub fn peer(&self) -> &DeviceAddress {
        &self.peer
    }
}

impl LinkSession for LeLink {
    fn kind(&self) -> TransportKind {
        TransportKind::LowEnergy
    }

    fn split(self: Box<Self>) -> (Box<dyn LinkWriter>, Box<dyn LinkReader>) {
        (
            Box::new(LeWriter {
                peer: self.peer,
                tx: Some(self.tx),
            }),
            Box::new(LeReader { rx: self.rx }),
        )
    }
}

/// Outbound half of a low-energy link.
pub struct LeWriter {
    peer: DeviceAddress,
    tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl LinkWriter for LeWriter {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Transport(format!("link to {} is closed", self.peer)))?;
        tx.send(frame)
            .await
            .map_err(|_| Error::Transport(format!("link to {} is closed", self.peer)))
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the sender ends the remote read loop.
        self.tx = None;
        Ok(())
    }
}

/// Inbound half of a low-energy link.
pub struct LeReader {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl LinkReader for LeReader {
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}
