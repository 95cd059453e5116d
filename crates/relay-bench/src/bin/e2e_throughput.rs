//! End-to-end throughput benchmark for the relay.
//!
//! Connects N WebSocket clients to a running server, has each of them send
//! small JSON messages as fast as the socket allows, and counts the envelopes
//! that come back out of the batched frames.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.get(2).cloned().unwrap_or_else(|| SERVER_URL.to_string());

    println!("Relay end-to-end throughput benchmark");
    println!("  Server:  {} (start it with: cargo run --release -p relay-server)", url);
    println!("  Clients: {}", num_clients);
    println!("  Warmup:  {}s, measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    run_broadcast_benchmark(num_clients, url).await;
}

async fn run_broadcast_benchmark(num_clients: usize, url: String) {
    let envelopes = Arc::new(AtomicU64::new(0));
    let frames = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let envelopes = Arc::clone(&envelopes);
        let frames = Arc::clone(&frames);
        let barrier = Arc::clone(&barrier);
        let url = url.clone();

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(client_id, &url, envelopes, frames, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        }));
    }

    barrier.wait().await;
    println!("All {} clients connected", num_clients);

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    envelopes.store(0, Ordering::SeqCst);
    frames.store(0, Ordering::SeqCst);
    let start = Instant::now();

    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed().as_secs_f64();
    let total_envelopes = envelopes.load(Ordering::SeqCst);
    let total_frames = frames.load(Ordering::SeqCst);

    println!();
    println!("Results");
    println!("  Duration:          {:>12.2}s", elapsed);
    println!("  Envelopes received:{:>12}", total_envelopes);
    println!("  Frames received:   {:>12}", total_frames);
    println!(
        "  Throughput:        {:>12.0} envelopes/s",
        total_envelopes as f64 / elapsed
    );
    println!(
        "  Per client:        {:>12.0} envelopes/s",
        total_envelopes as f64 / elapsed / num_clients as f64
    );
    if total_frames > 0 {
        println!(
            "  Mean batch size:   {:>12.1}",
            total_envelopes as f64 / total_frames as f64
        );
    }

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    url: &str,
    envelopes: Arc<AtomicU64>,
    frames: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    barrier.wait().await;

    // Each flush is a JSON array of envelopes.
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Text(text) = message {
                if let Ok(serde_json::Value::Array(batch)) = serde_json::from_str(&text) {
                    frames.fetch_add(1, Ordering::Relaxed);
                    envelopes.fetch_add(batch.len() as u64, Ordering::Relaxed);
                }
            }
        }
    });

    let payload = serde_json::json!({ "client": client_id, "msg": "benchmark" }).to_string();
    let message = Message::Text(payload);

    loop {
        if sender.send(message.clone()).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
