//! JSON codec for relay frames.
//!
//! Inbound frames are single JSON objects sent by clients. Outbound traffic
//! is batched: each write carries a JSON array of encoded envelopes.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::envelope::Envelope;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Inbound frame was empty after normalization.
    #[error("Empty message")]
    Empty,

    /// Inbound frame is not valid JSON.
    #[error("Invalid JSON: {0}")]
    Json(#[source] serde_json::Error),

    /// Inbound frame is valid JSON but not an object.
    #[error("Payload must be a JSON object")]
    NotAnObject,

    /// Envelope could not be encoded.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Normalize a raw inbound frame.
///
/// Embedded newlines become spaces and surrounding whitespace is trimmed.
#[must_use]
pub fn normalize(data: &[u8]) -> Vec<u8> {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);

    data[start..end]
        .iter()
        .map(|&b| if b == b'\n' { b' ' } else { b })
        .collect()
}

/// Decode a client frame into its payload object.
///
/// # Errors
///
/// Returns an error if the frame is empty, not JSON, or not a JSON object.
pub fn decode_inbound(data: &[u8]) -> Result<Map<String, Value>, ProtocolError> {
    let normalized = normalize(data);
    if normalized.is_empty() {
        return Err(ProtocolError::Empty);
    }

    match serde_json::from_slice(&normalized).map_err(ProtocolError::Json)? {
        Value::Object(map) => Ok(map),
        _ => Err(ProtocolError::NotAnObject),
    }
}

/// Encode an envelope to a single JSON frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let data = serde_json::to_vec(envelope).map_err(ProtocolError::Encode)?;
    Ok(Bytes::from(data))
}

/// Decode a single encoded envelope.
///
/// # Errors
///
/// Returns an error if the data is not a valid envelope.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    serde_json::from_slice(data).map_err(ProtocolError::Json)
}

/// Decode a batched write back into its envelopes.
///
/// # Errors
///
/// Returns an error if the data is not a JSON array of envelopes.
pub fn decode_batch(data: &[u8]) -> Result<Vec<Envelope>, ProtocolError> {
    serde_json::from_slice(data).map_err(ProtocolError::Json)
}

/// Accumulates pre-encoded frames into one JSON array literal.
#[derive(Debug)]
pub struct Batch {
    buf: BytesMut,
    frames: usize,
}

impl Batch {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create an empty batch with room for `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let mut buf = BytesMut::with_capacity(capacity.max(2));
        buf.put_u8(b'[');
        Self { buf, frames: 0 }
    }

    /// Append an encoded frame.
    pub fn push(&mut self, frame: &[u8]) {
        if self.frames > 0 {
            self.buf.put_u8(b',');
        }
        self.buf.extend_from_slice(frame);
        self.frames += 1;
    }

    /// Number of frames in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames
    }

    /// Check if no frame has been pushed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    /// Close the array and return the bytes to write.
    #[must_use]
    pub fn finish(mut self) -> Bytes {
        self.buf.put_u8(b']');
        self.buf.freeze()
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}
