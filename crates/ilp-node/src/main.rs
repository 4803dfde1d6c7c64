mod config;
mod startup;

use clap::Parser;
use config::ConfigOverrides;
use tracing_subscriber::EnvFilter;

/// Interledger connector node.
#[derive(Debug, Parser)]
#[command(name = "ilp-node", about = "Interledger BTP connector")]
struct Cli {
    /// Path to a YAML/JSON/TOML config file. Defaults to ./ilp-node.yaml if present.
    #[arg(long)]
    config: Option<String>,

    /// Overrides the configured node address.
    #[arg(long)]
    node_address: Option<String>,

    /// Overrides the configured BTP server bind address.
    #[arg(long)]
    bind_address: Option<String>,
}

impl From<Cli> for ConfigOverrides {
    fn from(cli: Cli) -> Self {
        ConfigOverrides {
            config_path: cli.config,
            node_address: cli.node_address,
            bind_address: cli.bind_address,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let overrides = ConfigOverrides::from(cli);
    let config = config::load(&overrides)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_filter.clone()))
        .init();

    let node = startup::Node::start(&config)?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    node.shutdown();
    node.join().await;

    Ok(())
}
