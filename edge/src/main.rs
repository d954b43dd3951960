//! SimSelector - Main Entry Point
//!
//! # Usage
//!
//! ```bash
//! simselector run              # boot run, then watch the description field
//! simselector once --force     # one pass from validation, ignoring uptime
//! simselector reset            # back to validation on the next run
//! simselector status
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use simselector_edge::config::{CONFIG_ENV, DEFAULT_CONFIG_PATH};
use simselector_edge::{EdgeConfig, SimSelectorDaemon};
use simselector_engine::{RunCommand, RunOutcome};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "simselector")]
#[command(version)]
#[command(about = "Pick the best SIM on a multi-SIM cellular router", long_about = None)]
struct Cli {
    /// Config file
    #[arg(long, short, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run at boot and keep watching for operator commands
    Run,
    /// Run the phase machine once and exit
    Once {
        /// Restart from validation regardless of uptime
        #[arg(long)]
        force: bool,
    },
    /// Set the phase back to validation
    Reset,
    /// Print phase and history
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    tracing::info!("SimSelector v{}", env!("CARGO_PKG_VERSION"));

    let config = EdgeConfig::load(&cli.config).unwrap_or_else(|e| {
        tracing::warn!("Config {} not usable ({}), using defaults", cli.config, e);
        EdgeConfig::default()
    });

    let daemon = SimSelectorDaemon::new(config).context("failed to build daemon")?;

    match cli.command {
        Commands::Run => {
            daemon.init().await?;
            daemon.run().await?;
        }
        Commands::Once { force } => {
            daemon.init().await?;
            let command = if force { RunCommand::Force } else { RunCommand::Start };
            match daemon.run_once(command).await.context("phase run failed")? {
                RunOutcome::Skipped { phase, reason } => println!("skipped ({}): {}", phase, reason),
                RunOutcome::Completed { report, .. } => println!("{}", report),
            }
        }
        Commands::Reset => {
            daemon.reset().await?;
            println!("phase reset to validation");
        }
        Commands::Status => {
            print!("{}", daemon.status().await?);
        }
    }

    Ok(())
}
