//! Daemon command for running the scheduling engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tokio::sync::watch;
use tracing::info;

use herald_gateway::HttpGateway;
use herald_scheduler::{Engine, SchedulerConfig};
use herald_store::MemoryRepository;

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub gateway_url: String,
    pub gateway_token: String,
    pub data_file: PathBuf,
    /// Poller interval in seconds.
    pub poll_interval: u64,
    pub workers: usize,
    /// Gateway request timeout in seconds.
    pub gateway_timeout: u64,
    /// Retry delay for unfinished campaigns in seconds.
    pub retry_delay: u64,
}

impl DaemonConfig {
    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.poll_interval.max(1)),
            worker_count: self.workers,
            retry_delay: Duration::from_secs(self.retry_delay),
            ..Default::default()
        }
    }
}

/// Run the engine until Ctrl-C.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let repo = MemoryRepository::open(&config.data_file).map_err(|e| miette::miette!("{}", e))?;
    info!(data_file = %config.data_file.display(), "repository opened");

    let gateway = HttpGateway::with_timeout(
        &config.gateway_url,
        &config.gateway_token,
        Duration::from_secs(config.gateway_timeout.max(1)),
    )
    .map_err(|e| miette::miette!("{}", e))?;
    info!(gateway_url = %gateway.base_url(), "gateway client ready");

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let engine = Engine::start(
        Arc::new(repo),
        Arc::new(gateway),
        config.scheduler_config(),
        shutdown_rx,
    );

    engine.join().await;
    info!("herald daemon shut down");
    Ok(())
}
