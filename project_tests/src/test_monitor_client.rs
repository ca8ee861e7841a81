//! # Consensus Monitor Client Test
//!
//! Connects to a running `consensus_monitor`, prints every patch it pushes and
//! reports message rate and key frequency at a fixed interval.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::Parser;
use futures_util::StreamExt;
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// WebSocket URL of the monitor
    #[clap(short, long, default_value = "ws://127.0.0.1:9001/ws")]
    url: String,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 10)]
    report_interval_seconds: u64,

    /// Print every received patch
    #[clap(short, long)]
    verbose: bool,
}

#[derive(Default)]
struct Stats {
    messages: u64,
    keys: BTreeMap<String, u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (mut ws, _) = connect_async(args.url.as_str()).await?;
    println!("[*] Connected to {}", args.url);

    let stats = Arc::new(Mutex::new(Stats::default()));

    // Clone for the reporter task
    let reporter_stats = Arc::clone(&stats);
    let interval = Duration::from_secs(args.report_interval_seconds.max(1));
    tokio::spawn(async move {
        let started = Instant::now();
        loop {
            tokio::time::sleep(interval).await;
            let Ok(stats) = reporter_stats.lock() else { break };
            let elapsed = started.elapsed().as_secs_f64();
            println!(
                "[REPORT] {} messages in {:.0}s ({:.2}/s), keys: {:?}",
                stats.messages,
                elapsed,
                stats.messages as f64 / elapsed,
                stats.keys
            );
        }
    });

    let mut first = true;
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => {
                let value: Value = serde_json::from_str(text.as_str())?;
                if first {
                    let complete = value.get("data_sources").is_some();
                    println!("[WELCOME] data_sources present: {}, keys: {}", complete, value.as_object().map_or(0, |o| o.len()));
                    first = false;
                }
                if args.verbose {
                    println!("{}", value);
                }
                if let (Some(object), Ok(mut stats)) = (value.as_object(), stats.lock()) {
                    stats.messages += 1;
                    for key in object.keys() {
                        *stats.keys.entry(key.clone()).or_default() += 1;
                    }
                }
            }
            Message::Close(frame) => {
                println!("[*] Server closed the connection: {:?}", frame);
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
