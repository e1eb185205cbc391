//! Wiring of queue, executors, poller and service.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use herald_gateway::MessageGateway;
use herald_store::Repository;

use crate::queue::{DispatchQueue, spawn_workers};
use crate::{CampaignLocks, CampaignService, DeliveryWorker, Poller, SchedulerConfig};

/// A running scheduling engine.
pub struct Engine {
    service: CampaignService,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Start the executor pool and the poller.
    ///
    /// Everything stops once `shutdown_rx` observes `true`; await
    /// [`Engine::join`] to wait for that.
    pub fn start(
        repo: Arc<dyn Repository>,
        gateway: Arc<dyn MessageGateway>,
        config: SchedulerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (queue, ready) = DispatchQueue::new(config.queue_capacity);
        let locks = CampaignLocks::new();

        let worker = Arc::new(DeliveryWorker::new(
            Arc::clone(&repo),
            gateway,
            queue.clone(),
            locks.clone(),
            &config,
        ));
        let mut tasks = spawn_workers(ready, config.worker_count, worker, shutdown_rx.clone());

        let poller = Poller::new(
            Arc::clone(&repo),
            queue.clone(),
            locks.clone(),
            config.poll_interval,
        );
        tasks.push(tokio::spawn(poller.run(shutdown_rx)));

        info!(
            workers = config.worker_count,
            poll_interval_secs = config.poll_interval.as_secs(),
            retry_delay_secs = config.retry_delay.as_secs(),
            "engine started"
        );

        Self {
            service: CampaignService::new(repo, queue, locks),
            tasks,
        }
    }

    /// Handle for managing campaigns and clients while the engine runs.
    pub fn service(&self) -> CampaignService {
        self.service.clone()
    }

    /// Wait for every engine task to stop.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        info!("engine stopped");
    }
}
