//! Per-connection client actor.
//!
//! A client owns one duplex transport. Its read loop turns inbound frames
//! into envelopes for the hub; its write loop drains the outbound queue the
//! hub fills and keeps the peer alive with pings. Either loop ending ends the
//! client.

use crate::hub::{HubError, HubHandle, Registration};
use crate::identity::{ClientKey, Identity};
use bytes::Bytes;
use relay_protocol::{codec, Batch, Envelope, ProtocolError};
use relay_transport::{Duplex, FrameSink, FrameSource, Inbound, TransportError};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure, deadline expiry or peer close.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed inbound frame.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The hub stopped.
    #[error(transparent)]
    Hub(#[from] HubError),
}

impl ClientError {
    /// Text placed in the error envelope sent back to the client.
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        match self {
            ClientError::Protocol(_) => "Invalid data",
            ClientError::Transport(_) | ClientError::Hub(_) => "Internal Error",
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Largest inbound frame accepted, in bytes.
    pub max_frame_size: usize,
    /// Outbound queue capacity, in frames.
    pub queue_capacity: usize,
    /// Read deadline, refreshed by every pong.
    pub pong_wait: Duration,
    /// Interval between pings. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Deadline for each write.
    pub write_wait: Duration,
}

impl ClientConfig {
    /// Set the read deadline and derive the ping period as 9/10 of it.
    #[must_use]
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.ping_period = pong_wait * 9 / 10;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 512,
            queue_capacity: 256,
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(54),
            write_wait: Duration::from_secs(10),
        }
    }
}

/// One live connection bound to a hub.
pub struct Client {
    key: ClientKey,
    identity: Identity,
    hub: HubHandle,
    config: ClientConfig,
}

impl Client {
    /// Create a client for an authorized identity.
    #[must_use]
    pub fn new(identity: Identity, hub: HubHandle, config: ClientConfig) -> Self {
        Self {
            key: ClientKey::next(),
            identity,
            hub,
            config,
        }
    }

    /// Connection key.
    #[must_use]
    pub fn key(&self) -> ClientKey {
        self.key
    }

    /// Client identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Register with the hub and pump the transport until the connection ends.
    ///
    /// The read loop runs on its own task; the write loop runs on the caller's.
    /// Returns `Ok(())` when the hub closed the outbound queue and the close
    /// frame was sent, or the error that ended the write loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is not running or a write failed.
    pub async fn run<T: Duplex>(self, transport: T) -> Result<(), ClientError> {
        let (outbound_tx, mut outbound_rx) = mpsc::channel(self.config.queue_capacity.max(1));

        self.hub
            .register(Registration {
                key: self.key,
                identity: self.identity.clone(),
                outbound: outbound_tx,
            })
            .await?;

        let (source, mut sink) = transport.split();

        let reader = tokio::spawn(read_loop(
            source,
            self.key,
            self.identity.clone(),
            self.hub.clone(),
            self.config.clone(),
        ));

        let result = write_loop(&mut sink, &mut outbound_rx, &self.config).await;

        // Dropping the read half along with the sink closes the transport.
        reader.abort();
        if self.hub.unregister(self.key, None).await.is_err() {
            debug!(client = %self.key, "Hub stopped before teardown");
        }
        if let Err(e) = &result {
            debug!(client = %self.key, uid = %self.identity.id, error = %e, "Write loop failed");
            let _ = timeout(self.config.write_wait, sink.close()).await;
        }

        debug!(client = %self.key, uid = %self.identity.id, "Client disconnected");
        result
    }
}

/// Inbound pump. Runs until the first error, then hands the client back to
/// the hub with an error envelope addressed to it.
async fn read_loop<S: FrameSource>(
    mut source: S,
    key: ClientKey,
    identity: Identity,
    hub: HubHandle,
    config: ClientConfig,
) {
    let mut deadline = Instant::now() + config.pong_wait;

    let error: ClientError = loop {
        let frame = match timeout_at(deadline, source.next_frame()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => break TransportError::ConnectionClosed.into(),
            Ok(Err(e)) => break e.into(),
            Err(_) => break TransportError::Timeout.into(),
        };

        match frame {
            Inbound::Pong => {
                trace!(client = %key, "Pong");
                deadline = Instant::now() + config.pong_wait;
            }
            Inbound::Data(data) => {
                if let Err(e) = submit(&data, &identity, &hub, &config).await {
                    break e;
                }
            }
        }
    };

    match &error {
        ClientError::Protocol(e) => {
            warn!(client = %key, uid = %identity.id, error = %e, "Rejected inbound frame")
        }
        e => debug!(client = %key, uid = %identity.id, error = %e, "Read loop ended"),
    }

    let farewell = Envelope::server_error(&identity.id, error.client_message());
    if hub.unregister(key, Some(farewell)).await.is_err() {
        debug!(client = %key, "Hub stopped before unregister");
    }
}

/// Validate one data frame and hand it to the hub.
async fn submit(
    data: &Bytes,
    identity: &Identity,
    hub: &HubHandle,
    config: &ClientConfig,
) -> Result<(), ClientError> {
    if data.len() > config.max_frame_size {
        return Err(TransportError::FrameTooLarge(data.len()).into());
    }

    let payload = codec::decode_inbound(data)?;
    let envelope = Envelope::from_client(&identity.id, &identity.label, payload);
    hub.route(envelope).await?;
    Ok(())
}

/// Outbound pump. Batches everything queued into one write, pings on a
/// timer, and sends a close frame once the hub closes the queue.
async fn write_loop<W: FrameSink>(
    sink: &mut W,
    outbound: &mut mpsc::Receiver<Bytes>,
    config: &ClientConfig,
) -> Result<(), ClientError> {
    let mut ping = interval_at(Instant::now() + config.ping_period, config.ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(first) = frame else {
                    // Queue closed: the client was unregistered or evicted.
                    if let Err(e) = with_deadline(config.write_wait, sink.close()).await {
                        trace!(error = %e, "Close frame not delivered");
                    }
                    return Ok(());
                };

                let mut batch = Batch::with_capacity(first.len() + 2);
                batch.push(&first);
                while let Ok(next) = outbound.try_recv() {
                    batch.push(&next);
                }

                let frames = batch.len();
                with_deadline(config.write_wait, sink.send_text(batch.finish())).await?;
                trace!(frames, "Flushed batch");
            }
            _ = ping.tick() => {
                with_deadline(config.write_wait, sink.send_ping()).await?;
            }
        }
    }
}

async fn with_deadline<F>(wait: Duration, write: F) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    timeout(wait, write)
        .await
        .map_err(|_| TransportError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Hub, HubConfig};
    use relay_protocol::codec::decode_batch;
    use relay_protocol::Source;
    use relay_transport::memory::{pair, MemoryPeer, Outbound};
    use serde_json::json;
    use tokio::task::JoinHandle;

    fn connect(
        hub: &HubHandle,
        id: &str,
        config: ClientConfig,
    ) -> (MemoryPeer, JoinHandle<Result<(), ClientError>>) {
        connect_with(hub, id, config, 64)
    }

    fn connect_with(
        hub: &HubHandle,
        id: &str,
        config: ClientConfig,
        transport_capacity: usize,
    ) -> (MemoryPeer, JoinHandle<Result<(), ClientError>>) {
        let (conn, peer) = pair(transport_capacity);
        let client = Client::new(Identity::new(id, id.to_uppercase()), hub.clone(), config);
        (peer, tokio::spawn(client.run(conn)))
    }

    async fn wait_for_clients(hub: &HubHandle, count: usize) {
        hub.subscribe_stats()
            .wait_for(|s| s.clients == count)
            .await
            .unwrap();
    }

    async fn next_batch(peer: &mut MemoryPeer) -> Vec<Envelope> {
        match peer.recv().await {
            Some(Outbound::Text(data)) => decode_batch(&data).unwrap(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    async fn assert_silent(peer: &mut MemoryPeer) {
        let waited = tokio::time::timeout(Duration::from_millis(50), peer.recv()).await;
        assert!(waited.is_err(), "unexpected frame: {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_a_broadcast() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (mut p1, _c1) = connect(&hub, "u1", ClientConfig::default());
        let (mut p2, _c2) = connect(&hub, "u2", ClientConfig::default());
        wait_for_clients(&hub, 2).await;

        p1.send_text(r#"{"msg":"hi"}"#).await.unwrap();

        let batch = next_batch(&mut p2).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].source, Source::Client);
        assert_eq!(batch[0].from_id.as_deref(), Some("u1"));
        assert_eq!(batch[0].from_label.as_deref(), Some("U1"));
        assert_eq!(batch[0].data, json!({"msg": "hi"}));

        assert_silent(&mut p1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_b_directed() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (mut p1, _c1) = connect(&hub, "u1", ClientConfig::default());
        let (mut p2, _c2) = connect(&hub, "u2", ClientConfig::default());
        let (mut p3, _c3) = connect(&hub, "u3", ClientConfig::default());
        wait_for_clients(&hub, 3).await;

        p1.send_text(r#"{"to_uid":"u2","msg":"psst"}"#).await.unwrap();

        let batch = next_batch(&mut p2).await;
        assert_eq!(batch[0].to_id.as_deref(), Some("u2"));
        assert_eq!(batch[0].data["msg"], "psst");

        assert_silent(&mut p1).await;
        assert_silent(&mut p3).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_c_empty_payload_disconnects() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (mut peer, client) = connect(&hub, "u1", ClientConfig::default());
        wait_for_clients(&hub, 1).await;

        peer.send_text("  \n ").await.unwrap();

        let batch = next_batch(&mut peer).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].source, Source::Server);
        assert_eq!(batch[0].to_id.as_deref(), Some("u1"));
        assert_eq!(batch[0].data, json!({"error": "Invalid data"}));
        assert_eq!(peer.recv().await, Some(Outbound::Close));

        assert!(client.await.unwrap().is_ok());
        wait_for_clients(&hub, 0).await;
        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_json_disconnects() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (mut peer, client) = connect(&hub, "u1", ClientConfig::default());
        wait_for_clients(&hub, 1).await;

        peer.send_text("{not json").await.unwrap();

        let batch = next_batch(&mut peer).await;
        assert_eq!(batch[0].data, json!({"error": "Invalid data"}));
        assert_eq!(peer.recv().await, Some(Outbound::Close));
        assert!(client.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_frame_disconnects() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let config = ClientConfig {
            max_frame_size: 16,
            ..ClientConfig::default()
        };
        let (mut peer, _client) = connect(&hub, "u1", config);
        wait_for_clients(&hub, 1).await;

        peer.send_text(r#"{"msg":"this is far too long"}"#).await.unwrap();

        let batch = next_batch(&mut peer).await;
        assert_eq!(batch[0].data, json!({"error": "Internal Error"}));
        assert_eq!(peer.recv().await, Some(Outbound::Close));
        wait_for_clients(&hub, 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_pong_times_out() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (mut peer, _client) = connect(&hub, "u1", ClientConfig::default());
        wait_for_clients(&hub, 1).await;
        let start = Instant::now();

        assert_eq!(peer.recv().await, Some(Outbound::Ping));
        assert!(start.elapsed() >= Duration::from_secs(54));
        assert!(start.elapsed() < Duration::from_secs(60));

        let batch = next_batch(&mut peer).await;
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(batch[0].data, json!({"error": "Internal Error"}));
        assert_eq!(peer.recv().await, Some(Outbound::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_extends_deadline() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (mut peer, _client) = connect(&hub, "u1", ClientConfig::default());
        wait_for_clients(&hub, 1).await;
        let start = Instant::now();

        assert_eq!(peer.recv().await, Some(Outbound::Ping));
        peer.send_pong().await.unwrap();

        // Still connected past the first 60s deadline.
        assert_eq!(peer.recv().await, Some(Outbound::Ping));
        assert!(start.elapsed() >= Duration::from_secs(108));
        assert!(start.elapsed() < Duration::from_secs(114));

        let batch = next_batch(&mut peer).await;
        assert!(start.elapsed() >= Duration::from_secs(114));
        assert_eq!(batch[0].data, json!({"error": "Internal Error"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_unregisters() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (peer, client) = connect(&hub, "u1", ClientConfig::default());
        wait_for_clients(&hub, 1).await;

        drop(peer);

        wait_for_clients(&hub, 0).await;
        // The write half is gone with the peer, so the close frame fails.
        let _ = client.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_loop_batches_queued_frames() {
        let (conn, mut peer) = pair(8);
        let (_source, mut sink) = conn.split();
        let (tx, mut rx) = mpsc::channel(8);

        for frame in ["1", "2", "3"] {
            tx.send(Bytes::from_static(frame.as_bytes())).await.unwrap();
        }
        drop(tx);

        write_loop(&mut sink, &mut rx, &ClientConfig::default())
            .await
            .unwrap();

        assert_eq!(
            peer.recv().await,
            Some(Outbound::Text(Bytes::from_static(b"[1,2,3]")))
        );
        assert_eq!(peer.recv().await, Some(Outbound::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_departed_peer_leaves_others_registered() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (p1, _c1) = connect(&hub, "u1", ClientConfig::default());
        let (p2, c2) = connect(&hub, "u2", ClientConfig::default());
        wait_for_clients(&hub, 2).await;

        // u2's peer goes away while u1 keeps talking.
        drop(p2);
        p1.send_text(r#"{"msg":"anyone?"}"#).await.unwrap();

        let _ = c2.await.unwrap();
        wait_for_clients(&hub, 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_order_preserved_across_batches() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (p1, _c1) = connect(&hub, "u1", ClientConfig::default());
        let (mut p2, _c2) = connect(&hub, "u2", ClientConfig::default());
        wait_for_clients(&hub, 2).await;

        for n in 1..=20 {
            p1.send_text(&format!(r#"{{"n":{n}}}"#)).await.unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 20 {
            for envelope in next_batch(&mut p2).await {
                seen.push(envelope.data["n"].as_u64().unwrap());
            }
        }
        assert_eq!(seen, (1..=20).collect::<Vec<u64>>());
        assert_silent(&mut p2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_client_is_evicted_and_closed() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (p1, _c1) = connect(&hub, "u1", ClientConfig::default());
        let config = ClientConfig {
            queue_capacity: 1,
            ..ClientConfig::default()
        };
        let (mut slow, slow_client) = connect_with(&hub, "u2", config, 1);
        wait_for_clients(&hub, 2).await;

        // Nothing is read from the slow peer, so its write loop stalls on the
        // transport and the hub-side queue overflows.
        for n in 1..=10 {
            p1.send_text(&format!(r#"{{"n":{n}}}"#)).await.unwrap();
        }
        wait_for_clients(&hub, 1).await;
        assert_eq!(hub.stats().evicted_total, 1);

        // What was queued before eviction still drains, then the close arrives.
        let mut seen = Vec::new();
        loop {
            match slow.recv().await {
                Some(Outbound::Text(data)) => {
                    for envelope in decode_batch(&data).unwrap() {
                        seen.push(envelope.data["n"].as_u64().unwrap());
                    }
                }
                Some(Outbound::Close) => break,
                other => panic!("expected text or close, got {other:?}"),
            }
        }
        assert!(!seen.is_empty() && seen.len() < 10);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));

        assert!(slow_client.await.unwrap().is_ok());
        assert_eq!(slow.recv().await, None);

        // Later traffic no longer reaches the evicted client.
        p1.send_text(r#"{"n":11}"#).await.unwrap();
        hub.subscribe_stats()
            .wait_for(|s| s.routed_total == 11)
            .await
            .unwrap();
        assert_eq!(hub.stats().clients, 1);
        assert_eq!(hub.stats().evicted_total, 1);
    }

    #[test]
    fn test_client_messages() {
        assert_eq!(
            ClientError::from(ProtocolError::Empty).client_message(),
            "Invalid data"
        );
        assert_eq!(
            ClientError::from(TransportError::Timeout).client_message(),
            "Internal Error"
        );
    }

    #[test]
    fn test_ping_period_derivation() {
        let config = ClientConfig::default().with_pong_wait(Duration::from_secs(30));
        assert_eq!(config.ping_period, Duration::from_secs(27));
    }
}
