//! # relay-transport
//!
//! Transport abstraction layer for the relay hub.
//!
//! A connection is anything implementing [`Duplex`]: it splits into a
//! [`FrameSource`] read half and a [`FrameSink`] write half, so a client's
//! read loop and write loop each own exactly one side.
//!
//! - **WebSocket** - upgraded axum sockets (`websocket` feature)
//! - **Memory** - channel-backed pairs for tests and benchmarks
//!
//! ```rust,ignore
//! use relay_transport::{Duplex, FrameSource};
//!
//! async fn drain(conn: impl Duplex) {
//!     let (mut source, _sink) = conn.split();
//!     while let Ok(Some(frame)) = source.next_frame().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Duplex, FrameSink, FrameSource, Inbound, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketSink, WebSocketSource};
