// Container-side entry point: wait for the host to announce itself, then run
// the container half of the named test. A non-zero exit reports failure.
use anyhow::{Context, Result};
use clap::Parser;
use duet_common::cases;
use duet_common::config::EXCHANGE_PORT;
use duet_common::exchange::learn_peer_address;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "duet-runner")]
#[command(about = "Runs the container half of a duet test", long_about = None)]
struct Cli {
    /// Name of the test to run
    #[arg(short, long)]
    name: String,

    /// Port to listen on for the host's address
    #[arg(short, long, default_value_t = EXCHANGE_PORT)]
    port: u16,

    /// How long to wait for the host to connect
    #[arg(long, default_value_t = 60_000)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let registry = cases::default_registry().context("Failed to build test registry")?;
    let test = registry.lookup(&cli.name)?;
    info!(test = %cli.name, "Running test");

    let host = learn_peer_address(cli.port, Duration::from_millis(cli.timeout_ms))
        .await
        .context("Failed to learn host address")?;

    test.container_action(host)
        .await
        .with_context(|| format!("Failed running test {:?}", cli.name))?;

    info!(test = %cli.name, "Test passed");
    Ok(())
}
