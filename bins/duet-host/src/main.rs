mod aggregator;
mod diagnostics;
mod docker;
mod orchestrator;
mod runner;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use docker::DockerRunner;
use duet_common::cases;
use duet_common::config::HarnessConfig;
use orchestrator::Orchestrator;
use runner::{ContainerRunner, InProcessRunner};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "duet-host")]
#[command(about = "Duet - run two-sided container/host network tests", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered tests
    List,

    /// Run one test, or every registered test
    Run {
        /// Test name (e.g., Echo, FilterInputDropUDP)
        #[arg(short, long, conflicts_with = "all", required_unless_present = "all")]
        name: Option<String>,

        /// Run every registered test
        #[arg(long)]
        all: bool,

        /// Run the container side on a local task instead of Docker
        #[arg(long)]
        in_process: bool,

        /// Harness config file (defaults to config/harness.json if present)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let registry = cases::default_registry().context("Failed to build test registry")?;

    match cli.command {
        Commands::List => {
            for name in registry.names() {
                println!("{}", name);
            }
        }
        Commands::Run {
            name,
            all,
            in_process,
            config,
        } => {
            let config = HarnessConfig::resolve(config.as_deref())?;
            info!(
                image = %config.image,
                exchange_port = config.exchange_port,
                run_timeout_ms = config.run_timeout_ms,
                in_process,
                "Duet host booting..."
            );

            let runner: Box<dyn ContainerRunner> = if in_process {
                Box::new(InProcessRunner::new(registry.clone(), &config))
            } else {
                Box::new(DockerRunner::connect()?)
            };

            let names: Vec<&str> = if all {
                registry.names()
            } else {
                name.as_deref().into_iter().collect()
            };

            let orchestrator = Orchestrator::new(registry.clone(), runner, config);
            let verdicts = orchestrator.run_all(&names).await;

            let mut failed = 0;
            for (name, verdict) in &verdicts {
                println!("{:<36} {}", name, verdict);
                if !verdict.is_passed() {
                    failed += 1;
                }
            }

            if failed > 0 {
                error!(failed, total = verdicts.len(), "Some tests failed");
                bail!("{} of {} tests failed", failed, verdicts.len());
            }
            info!(total = verdicts.len(), "All tests passed");
        }
    }

    Ok(())
}
