//! # relay-protocol
//!
//! Wire model for the relay hub.
//!
//! Clients send single JSON objects; the relay wraps each one in an
//! [`Envelope`] and writes envelopes back out in JSON array batches.
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Envelope};
//!
//! let payload = codec::decode_inbound(b"{\"msg\": \"hi\"}").unwrap();
//! let envelope = Envelope::from_client("u1", "alice", payload);
//! assert!(envelope.is_excluded_for("u1"));
//!
//! let mut batch = codec::Batch::new();
//! batch.push(&codec::encode(&envelope).unwrap());
//! let decoded = codec::decode_batch(&batch.finish()).unwrap();
//! assert_eq!(decoded, vec![envelope]);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, decode_inbound, encode, Batch, ProtocolError};
pub use envelope::{Envelope, Source, DIRECT_TO_FIELD};
