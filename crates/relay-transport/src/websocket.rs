//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] to the [`Duplex`] traits. Pings from
//! the peer are answered by the underlying protocol stack.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, trace};

use crate::traits::{Duplex, FrameSink, FrameSource, Inbound, TransportError};

/// Read half of an upgraded WebSocket.
pub struct WebSocketSource {
    stream: SplitStream<WebSocket>,
}

/// Write half of an upgraded WebSocket.
pub struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
}

impl Duplex for WebSocket {
    type Source = WebSocketSource;
    type Sink = WebSocketSink;

    fn split(self) -> (Self::Source, Self::Sink) {
        let (sink, stream) = StreamExt::split(self);
        (WebSocketSource { stream }, WebSocketSink { sink })
    }
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn next_frame(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Inbound::Data(Bytes::from(text)))),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(Inbound::Data(Bytes::from(data))))
                }
                Some(Ok(Message::Pong(_))) => return Ok(Some(Inbound::Pong)),
                Some(Ok(Message::Ping(_))) => {
                    trace!("Ping from peer");
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_text(&mut self, data: Bytes) -> Result<(), TransportError> {
        // A uniquely owned `Bytes` converts back into its `Vec` in place, so
        // only the UTF-8 check walks the batch.
        let text = String::from_utf8(Vec::from(data))
            .map_err(|e| TransportError::SendFailed(format!("batch is not UTF-8: {}", e)))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}
