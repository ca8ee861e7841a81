//! # Cosmos Source Live Data Test
//!
//! Fetches one round from a live Cosmos node through `CosmosClient`,
//! aggregates it and prints the resulting snapshot as a full patch.

use std::time::Duration;

use clap::Parser;
use lib_common::core::{aggregate, ParticipationMetric, Patch, RoundSource};
use lib_common::cosmos::CosmosClient;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Cosmos SDK REST API base URL
    #[clap(short, long)]
    api: String,

    /// CometBFT RPC base URL
    #[clap(short, long)]
    rpc: String,

    /// Per-source timeout in milliseconds
    #[clap(short, long, default_value_t = 5_000)]
    timeout_ms: u64,

    /// Participation metric (voting-power or count)
    #[clap(short, long, default_value_t = ParticipationMetric::VotingPower)]
    metric: ParticipationMetric,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = CosmosClient::new(&args.api, &args.rpc, Duration::from_millis(args.timeout_ms))?;

    println!("[*] Loading monikers from {} ...", args.api);
    match client.load_monikers().await {
        Ok(count) => println!("[INFO] {} monikers known", count),
        Err(e) => eprintln!("[WARN] Moniker walk failed, validators shown by address: {}", e),
    }

    println!("[*] Requesting one round from {} / {} ...", args.api, args.rpc);

    let raw = match client.fetch_round().await {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("\n[ERROR] Fetch failed:");
            eprintln!(">>> {}", e);
            std::process::exit(1);
        }
    };
    println!(
        "[INFO] validator set at height {} ({} validators), round {}/{} step {}",
        raw.validators.height,
        raw.validators.validators.len(),
        raw.round.height,
        raw.round.round,
        raw.round.step
    );

    match aggregate(&raw, None, args.metric) {
        Ok(snapshot) => {
            let patch = Patch::full(&snapshot).with_data_sources(client.data_sources());
            println!("\n[SUCCESS] Snapshot:");
            println!("-----------------------------------------------");
            println!("{}", serde_json::to_string_pretty(&patch)?);
            println!("-----------------------------------------------");
            println!(
                "[INFO] prevotes {}% ({} power), precommits {}% ({} power), total power {}",
                snapshot.prevote_percentage,
                snapshot.prevote_power,
                snapshot.precommit_percentage,
                snapshot.precommit_power,
                snapshot.total_power()
            );
        }
        Err(e) => {
            eprintln!("\n[ERROR] Aggregation failed:");
            eprintln!(">>> {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
