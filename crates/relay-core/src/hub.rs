//! The hub: registry of live clients and the routing loop.
//!
//! All registry mutations happen inside a single task consuming three event
//! channels (registrations, departures, envelopes to route). Nothing else
//! touches the registry, so it needs no lock.

use crate::identity::{ClientKey, Identity};
use bytes::Bytes;
use relay_protocol::{codec, Envelope};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The routing loop is no longer running.
    #[error("Hub is not running")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each inbound event channel.
    pub channel_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

/// Hub statistics, published after every handled event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Currently registered clients.
    pub clients: usize,
    /// Registrations since start.
    pub registered_total: u64,
    /// Clients evicted for a full or closed outbound queue.
    pub evicted_total: u64,
    /// Envelopes routed.
    pub routed_total: u64,
    /// Frames enqueued onto outbound queues.
    pub delivered_total: u64,
}

/// Request to add a client to the registry.
#[derive(Debug)]
pub struct Registration {
    /// Connection key.
    pub key: ClientKey,
    /// Resolved identity.
    pub identity: Identity,
    /// Producer side of the client's outbound queue.
    pub outbound: mpsc::Sender<Bytes>,
}

/// Request to remove a client from the registry.
#[derive(Debug)]
pub struct Departure {
    /// Connection key.
    pub key: ClientKey,
    /// Envelope delivered to this connection alone just before removal,
    /// typically an error for the client.
    pub farewell: Option<Envelope>,
}

/// Result of routing one envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Clients the frame was enqueued for.
    pub delivered: usize,
    /// Clients evicted during this fan-out.
    pub evicted: usize,
}

struct Member {
    identity: Identity,
    outbound: mpsc::Sender<Bytes>,
}

/// The set of registered clients and the handlers for each hub event.
///
/// Owned by the routing loop; exposed for direct use in tests and benchmarks.
pub struct Registry {
    members: HashMap<ClientKey, Member>,
    stats: HubStats,
    stats_tx: watch::Sender<HubStats>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (stats_tx, _) = watch::channel(HubStats::default());
        Self {
            members: HashMap::new(),
            stats: HubStats::default(),
            stats_tx,
        }
    }

    /// Subscribe to statistics updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HubStats> {
        self.stats_tx.subscribe()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        self.stats
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if no client is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, key: ClientKey) -> bool {
        self.members.contains_key(&key)
    }

    /// Add a client. It becomes a fan-out target immediately.
    pub fn register(&mut self, registration: Registration) {
        let Registration {
            key,
            identity,
            outbound,
        } = registration;

        info!(client = %key, uid = %identity.id, name = %identity.label, "Registered client");
        self.members.insert(key, Member { identity, outbound });
        self.stats.registered_total += 1;
        self.publish();
    }

    /// Remove a client and close its outbound queue.
    ///
    /// A farewell envelope, if any, is enqueued on the departing connection's
    /// own queue just before it closes. Other connections sharing the same
    /// identity never see it. Returns `true` if the client was registered;
    /// removing an unknown client is a no-op.
    pub fn unregister(&mut self, key: ClientKey, farewell: Option<&Envelope>) -> bool {
        // Dropping the sender closes the queue; the write loop drains and exits.
        match self.members.remove(&key) {
            Some(member) => {
                if let Some(envelope) = farewell {
                    self.farewell(key, &member, envelope);
                }
                info!(client = %key, uid = %member.identity.id, "Unregistered client");
                self.publish();
                true
            }
            None => {
                trace!(client = %key, "Unregister for unknown client");
                false
            }
        }
    }

    /// Fan an envelope out to every client it is not excluded for.
    ///
    /// Enqueueing never waits: a client whose queue is full (or already
    /// closed) is evicted on the spot and the sender is not told.
    pub fn route(&mut self, envelope: &Envelope) -> RouteOutcome {
        self.stats.routed_total += 1;

        let frame = match codec::encode(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping envelope that failed to encode");
                self.publish();
                return RouteOutcome::default();
            }
        };

        let mut outcome = RouteOutcome::default();
        let mut evicted = Vec::new();

        for (key, member) in &self.members {
            if envelope.is_excluded_for(&member.identity.id) {
                continue;
            }

            match member.outbound.try_send(frame.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(client = %key, uid = %member.identity.id, "Outbound queue full, evicting client");
                    evicted.push(*key);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(client = %key, uid = %member.identity.id, "Outbound queue closed, evicting client");
                    evicted.push(*key);
                }
            }
        }

        for key in &evicted {
            self.members.remove(key);
        }
        outcome.evicted = evicted.len();

        self.stats.delivered_total += outcome.delivered as u64;
        self.stats.evicted_total += outcome.evicted as u64;
        self.publish();

        trace!(
            from = ?envelope.from_id,
            to = ?envelope.to_id,
            delivered = outcome.delivered,
            evicted = outcome.evicted,
            "Routed envelope"
        );
        outcome
    }

    fn farewell(&mut self, key: ClientKey, member: &Member, envelope: &Envelope) {
        self.stats.routed_total += 1;

        let frame = match codec::encode(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(client = %key, error = %e, "Dropping farewell that failed to encode");
                return;
            }
        };

        match member.outbound.try_send(frame) {
            Ok(()) => self.stats.delivered_total += 1,
            Err(e) => {
                debug!(client = %key, uid = %member.identity.id, error = %e, "Farewell not delivered")
            }
        }
    }

    fn publish(&mut self) {
        self.stats.clients = self.members.len();
        self.stats_tx.send_replace(self.stats);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// The hub routing loop.
pub struct Hub {
    registry: Registry,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<Departure>,
    route_rx: mpsc::Receiver<Envelope>,
}

impl Hub {
    /// Create a hub and the handle used to talk to it.
    #[must_use]
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let capacity = config.channel_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (route_tx, route_rx) = mpsc::channel(capacity);

        let registry = Registry::new();
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            route_tx,
            stats_rx: registry.subscribe(),
        };

        let hub = Self {
            registry,
            register_rx,
            unregister_rx,
            route_rx,
        };
        (hub, handle)
    }

    /// Create a hub and spawn its routing loop.
    #[must_use]
    pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(config);
        (handle, tokio::spawn(hub.run()))
    }

    /// Run the routing loop until every [`HubHandle`] is dropped.
    ///
    /// Exactly one event is handled per iteration. The three sources are
    /// polled in random order so none of them starves.
    pub async fn run(self) {
        let Hub {
            mut registry,
            mut register_rx,
            mut unregister_rx,
            mut route_rx,
        } = self;

        info!("Hub routing loop started");

        loop {
            tokio::select! {
                Some(registration) = register_rx.recv() => {
                    registry.register(registration);
                }
                Some(departure) = unregister_rx.recv() => {
                    registry.unregister(departure.key, departure.farewell.as_ref());
                }
                Some(envelope) = route_rx.recv() => {
                    registry.route(&envelope);
                }
                else => break,
            }
        }

        info!(clients = registry.len(), "Hub routing loop stopped");
    }
}

/// Cloneable front door to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<Departure>,
    route_tx: mpsc::Sender<Envelope>,
    stats_rx: watch::Receiver<HubStats>,
}

impl HubHandle {
    /// Submit a registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is not running.
    pub async fn register(&self, registration: Registration) -> Result<(), HubError> {
        self.register_tx
            .send(registration)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Submit a departure.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is not running.
    pub async fn unregister(
        &self,
        key: ClientKey,
        farewell: Option<Envelope>,
    ) -> Result<(), HubError> {
        self.unregister_tx
            .send(Departure { key, farewell })
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Submit an envelope for routing.
    ///
    /// Waits while the route queue is full, which backpressures producers.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is not running.
    pub async fn route(&self, envelope: Envelope) -> Result<(), HubError> {
        self.route_tx
            .send(envelope)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Latest published statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        *self.stats_rx.borrow()
    }

    /// Receiver notified whenever statistics change.
    #[must_use]
    pub fn subscribe_stats(&self) -> watch::Receiver<HubStats> {
        self.stats_rx.clone()
    }
}
