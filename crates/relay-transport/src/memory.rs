//! In-memory transport.
//!
//! A channel-backed [`Duplex`] with a scripted peer on the other end, used to
//! drive clients in tests and benchmarks without sockets.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::traits::{Duplex, FrameSink, FrameSource, Inbound, TransportError};

/// What the peer observes from the relay side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text message.
    Text(Bytes),
    /// A liveness probe.
    Ping,
    /// A close frame.
    Close,
}

impl Outbound {
    /// Text payload, if this is a text message.
    #[must_use]
    pub fn as_text(&self) -> Option<&Bytes> {
        match self {
            Outbound::Text(data) => Some(data),
            _ => None,
        }
    }
}

/// Create a connected transport/peer pair.
#[must_use]
pub fn pair(capacity: usize) -> (MemoryConnection, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

    let connection = MemoryConnection {
        source: MemorySource { inbound: inbound_rx },
        sink: MemorySink {
            outbound: outbound_tx,
            closed: false,
        },
    };
    let peer = MemoryPeer {
        inbound: inbound_tx,
        outbound: outbound_rx,
    };
    (connection, peer)
}

/// Relay side of an in-memory connection.
pub struct MemoryConnection {
    source: MemorySource,
    sink: MemorySink,
}

impl Duplex for MemoryConnection {
    type Source = MemorySource;
    type Sink = MemorySink;

    fn split(self) -> (Self::Source, Self::Sink) {
        (self.source, self.sink)
    }
}

/// Read half of an in-memory connection.
pub struct MemorySource {
    inbound: mpsc::Receiver<Result<Inbound, TransportError>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.inbound.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Write half of an in-memory connection.
pub struct MemorySink {
    outbound: mpsc::Sender<Outbound>,
    closed: bool,
}

impl MemorySink {
    async fn push(&mut self, event: Outbound) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(event)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.push(Outbound::Text(data)).await
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.push(Outbound::Ping).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        let result = self.push(Outbound::Close).await;
        self.closed = true;
        result
    }
}

/// Remote end of an in-memory connection.
///
/// Dropping the peer ends the relay's read half as a clean close.
pub struct MemoryPeer {
    inbound: mpsc::Sender<Result<Inbound, TransportError>>,
    outbound: mpsc::Receiver<Outbound>,
}

impl MemoryPeer {
    /// Send a text frame to the relay.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay side has gone away.
    pub async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.send(Ok(Inbound::Data(Bytes::copy_from_slice(text.as_bytes()))))
            .await
    }

    /// Acknowledge a ping.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay side has gone away.
    pub async fn send_pong(&self) -> Result<(), TransportError> {
        self.send(Ok(Inbound::Pong)).await
    }

    /// Make the relay's next read fail with `error`.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay side has gone away.
    pub async fn fail(&self, error: TransportError) -> Result<(), TransportError> {
        self.send(Err(error)).await
    }

    async fn send(&self, item: Result<Inbound, TransportError>) -> Result<(), TransportError> {
        self.inbound
            .send(item)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for the next event written by the relay.
    ///
    /// Returns `None` once the relay dropped its write half.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Take an already written event without waiting.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }
}
