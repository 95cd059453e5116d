//! # relay-core
//!
//! Hub and client actors for the relay.
//!
//! - **Hub** - registry of live clients and the single routing loop
//! - **Client** - per-connection read/write pumps with liveness and batching
//! - **Identity** - who a connection belongs to
//!
//! ## Architecture
//!
//! ```text
//!  transport ──▶ read loop ──route──▶ ┌─────────┐
//!                                     │   Hub   │──try_send──▶ outbound queue ──▶ write loop ──▶ transport
//!  boundary ──register/unregister───▶ └─────────┘
//! ```
//!
//! A full outbound queue never blocks the hub: the slow client is evicted.

pub mod client;
pub mod hub;
pub mod identity;

pub use client::{Client, ClientConfig, ClientError};
pub use hub::{
    Departure, Hub, HubConfig, HubError, HubHandle, HubStats, Registration, Registry,
    RouteOutcome,
};
pub use identity::{ClientKey, Identity};
