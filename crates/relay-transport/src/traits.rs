//! Transport abstraction traits for the relay.
//!
//! A live connection is a [`Duplex`]: it splits into a read half driven by
//! the client's read loop and a write half driven by its write loop. Neither
//! half is ever shared between the two loops.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A read or write deadline expired.
    #[error("Connection timed out")]
    Timeout,

    /// Inbound frame exceeds the configured read limit.
    #[error("Frame of {0} bytes exceeds the read limit")]
    FrameTooLarge(usize),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// An event read from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A data frame (text or binary).
    Data(Bytes),
    /// Liveness acknowledgment for one of our pings.
    Pong,
}

/// Read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next event from the peer.
    ///
    /// Returns `None` once the peer has closed the connection. Pings from
    /// the peer are answered by the implementation and never surface here.
    async fn next_frame(&mut self) -> Result<Option<Inbound>, TransportError>;
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one text message.
    async fn send_text(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Send a liveness probe.
    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Send a close frame and shut the write half down.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A connection that can be split into independently owned halves.
pub trait Duplex: Send + 'static {
    /// Read half.
    type Source: FrameSource + 'static;
    /// Write half.
    type Sink: FrameSink + 'static;

    /// Split the connection.
    fn split(self) -> (Self::Source, Self::Sink);
}
