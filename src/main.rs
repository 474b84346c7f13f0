use clap::Parser;
use colored::*;
use simulation::{run_simulation, SimulationParams};
pub mod simulation;

/// Replays concurrent multi-domain replication traffic through the change
/// number indexer and verifies the resulting global index.
#[derive(Parser, Debug)]
#[command(name = "sardonyx")]
#[command(about = "Change number indexing simulation")]
#[command(version)]
struct Args {
    /// Number of replicas writing to every domain
    #[arg(short, long, default_value_t = 4)]
    replicas: usize,

    /// Number of replicated domains
    #[arg(short, long, default_value_t = 2)]
    domains: usize,

    /// Updates published by each replica
    #[arg(short, long, default_value_t = 500)]
    updates: usize,

    /// Take the first replica offline after this many updates
    #[arg(long)]
    offline_after: Option<usize>,

    /// Records the indexer appends per cycle
    #[arg(long, default_value_t = 1000)]
    max_records_per_cycle: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let args = Args::parse();

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║            CHANGE NUMBER INDEX SIMULATION                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!(
        "  Replicas: {} | Domains: {} | Updates/Replica: {}",
        args.replicas, args.domains, args.updates
    );

    let params = SimulationParams {
        replicas: args.replicas,
        domains: args.domains,
        updates: args.updates,
        offline_after: args.offline_after,
        max_records_per_cycle: args.max_records_per_cycle,
    };

    match run_simulation(params).await {
        Ok(stats) => stats.print(),
        Err(err) => {
            eprintln!("{} {}", "✗ simulation failed:".red(), err);
            std::process::exit(1);
        }
    }
}
