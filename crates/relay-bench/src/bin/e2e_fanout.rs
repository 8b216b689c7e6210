//! End-to-end fan-out benchmark for the relay.
//!
//! Connects many WebSocket clients to a running server and measures how long
//! each takes to receive the replay window, then the delivery rate of live
//! items across all clients.

use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8081/";
const REPLAY_WINDOW: usize = 10;
const BENCH_SECS: u64 = 30;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            Relay End-to-End Fan-out Benchmark                ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_fanout_benchmark(&url, num_clients).await;
}

async fn run_fanout_benchmark(url: &str, num_clients: usize) {
    println!("📊 Fan-out Benchmark: {} clients against {}", num_clients, url);
    println!("   Measurement: {}s", BENCH_SECS);
    println!();

    let item_count = Arc::new(AtomicU64::new(0));
    let byte_count = Arc::new(AtomicU64::new(0));
    let replay_times = Arc::new(Mutex::new(Vec::with_capacity(num_clients)));

    let start = Instant::now();
    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let url = url.to_string();
        let items = Arc::clone(&item_count);
        let bytes = Arc::clone(&byte_count);
        let replay_times = Arc::clone(&replay_times);

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(&url, items, bytes, replay_times).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_items = item_count.load(Ordering::SeqCst);
    let total_bytes = byte_count.load(Ordering::SeqCst);

    let mut replay_times = replay_times.lock().await.clone();
    replay_times.sort();
    let replayed = replay_times.len();
    let percentile = |p: f64| -> f64 {
        if replay_times.is_empty() {
            return 0.0;
        }
        let index = ((replayed as f64 - 1.0) * p).round() as usize;
        replay_times[index].as_secs_f64()
    };

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Items Received:       {:>10}                           ║",
        total_items
    );
    println!(
        "║  Bytes Received:       {:>10}                           ║",
        total_bytes
    );
    println!(
        "║  Throughput:           {:>10.1} items/s                  ║",
        total_items as f64 / elapsed.as_secs_f64()
    );
    println!(
        "║  Full Replay:          {:>10} clients                    ║",
        replayed
    );
    println!(
        "║  Replay p50:           {:>10.2}s                          ║",
        percentile(0.5)
    );
    println!(
        "║  Replay p99:           {:>10.2}s                          ║",
        percentile(0.99)
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

/// Check that a frame carries a decodable record.
fn is_record(message: &Message) -> bool {
    match message {
        Message::Text(text) => serde_json::from_str::<serde_json::Value>(text).is_ok(),
        Message::Binary(data) => rmp_serde::from_slice::<serde_json::Value>(data).is_ok(),
        _ => false,
    }
}

async fn run_client(
    url: &str,
    items: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
    replay_times: Arc<Mutex<Vec<Duration>>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let connected_at = Instant::now();
    let (ws, _) = connect_async(url).await?;
    let (_sender, mut receiver) = ws.split();

    let mut received = 0usize;
    while let Some(message) = receiver.next().await {
        let message = message?;
        if !is_record(&message) {
            continue;
        }

        received += 1;
        items.fetch_add(1, Ordering::Relaxed);
        bytes.fetch_add(message.len() as u64, Ordering::Relaxed);

        if received == REPLAY_WINDOW {
            replay_times.lock().await.push(connected_at.elapsed());
        }
    }

    Ok(())
}
