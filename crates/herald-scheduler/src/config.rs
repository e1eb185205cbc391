//! Scheduler configuration.

use std::time::Duration;

/// Default poller tick interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

/// Default number of concurrent job executors.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default capacity of the ready-job channel.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default delay before an unfinished campaign is retried, in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

/// Default number of in-flight gateway calls within one delivery pass.
pub const DEFAULT_DELIVERY_CONCURRENCY: usize = 8;

/// Tunables of the scheduling engine.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the poller scans campaigns.
    pub poll_interval: Duration,
    /// Number of job executors pulling from the dispatch queue.
    pub worker_count: usize,
    /// Capacity of the channel between the queue timers and the executors.
    pub queue_capacity: usize,
    /// Not-before offset used when re-submitting an unfinished campaign.
    /// Zero re-submits immediately.
    pub retry_delay: Duration,
    /// Upper bound on concurrent gateway calls within one delivery pass.
    pub delivery_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            delivery_concurrency: DEFAULT_DELIVERY_CONCURRENCY,
        }
    }
}
