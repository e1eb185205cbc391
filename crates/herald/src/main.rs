//! Herald: timed mass-messaging campaigns
//!
//! Main binary with subcommands:
//! - `daemon`: Scheduling engine (poller, dispatch workers)
//! - `import`: Load clients and campaigns from a JSON file
//! - `stats`: Print delivery statistics

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use herald_scheduler::{
    DEFAULT_POLL_INTERVAL_SECS, DEFAULT_RETRY_DELAY_SECS, DEFAULT_WORKER_COUNT,
};

mod daemon;
mod import;
mod stats;

#[derive(Parser)]
#[command(name = "herald")]
#[command(about = "Timed mass-messaging campaign engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling engine until interrupted
    Daemon {
        /// Base URL of the delivery gateway; messages are POSTed to `{url}/{id}`
        #[arg(long, env = "HERALD_GATEWAY_URL")]
        gateway_url: String,

        /// Bearer token for the delivery gateway
        #[arg(long, env = "HERALD_GATEWAY_TOKEN")]
        gateway_token: String,

        /// JSON snapshot file holding campaigns, clients and messages
        #[arg(long, env = "HERALD_DATA_FILE")]
        data_file: PathBuf,

        /// Poller interval in seconds
        #[arg(long, env = "HERALD_POLL_INTERVAL", default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
        poll_interval: u64,

        /// Number of dispatch workers
        #[arg(long, env = "HERALD_WORKERS", default_value_t = DEFAULT_WORKER_COUNT)]
        workers: usize,

        /// Gateway request timeout in seconds
        #[arg(long, env = "HERALD_GATEWAY_TIMEOUT", default_value = "10")]
        gateway_timeout: u64,

        /// Delay in seconds before an unfinished campaign is retried
        #[arg(long, env = "HERALD_RETRY_DELAY", default_value_t = DEFAULT_RETRY_DELAY_SECS)]
        retry_delay: u64,
    },

    /// Import clients and campaigns from a JSON file
    Import {
        /// JSON snapshot file to import into
        #[arg(long, env = "HERALD_DATA_FILE")]
        data_file: PathBuf,

        /// File of the form `{"clients": [...], "campaigns": [...]}`
        #[arg(long)]
        input: PathBuf,
    },

    /// Print delivery statistics as JSON
    Stats {
        /// JSON snapshot file to read
        #[arg(long, env = "HERALD_DATA_FILE")]
        data_file: PathBuf,

        /// Show a single campaign instead of the summary
        #[arg(long)]
        campaign: Option<u64>,

        /// Include every message of the campaign
        #[arg(long)]
        detailed: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "herald=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            gateway_url,
            gateway_token,
            data_file,
            poll_interval,
            workers,
            gateway_timeout,
            retry_delay,
        } => {
            daemon::run(daemon::DaemonConfig {
                gateway_url,
                gateway_token,
                data_file,
                poll_interval,
                workers,
                gateway_timeout,
                retry_delay,
            })
            .await
        }

        Commands::Import { data_file, input } => import::run(&data_file, &input).await,

        Commands::Stats {
            data_file,
            campaign,
            detailed,
        } => stats::run(&data_file, campaign, detailed).await,
    }
}
