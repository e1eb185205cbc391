//! Campaign scheduling and delivery engine for Herald.
//!
//! This crate provides:
//! - A dispatch queue with per-campaign dedup, not-before and expiry
//! - A poller that submits open campaigns and expires closed ones
//! - A delivery worker that fans campaigns out and sends their messages
//! - Status reconciliation from aggregate message state
//! - A campaign service enforcing status-gated edits, plus statistics

mod config;
mod engine;
mod error;
mod locks;
mod poller;
pub mod queue;
mod reconcile;
mod service;
mod worker;

pub use config::{
    DEFAULT_DELIVERY_CONCURRENCY, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_RETRY_DELAY_SECS, DEFAULT_WORKER_COUNT, SchedulerConfig,
};
pub use engine::Engine;
pub use error::SchedulerError;
pub use locks::CampaignLocks;
pub use poller::{Poller, TickReport};
pub use queue::{DispatchJob, DispatchQueue, JobHandler, ReadyJobs, SubmitOutcome};
pub use reconcile::{Reconciler, reconcile};
pub use service::{CampaignService, CampaignStats, StatsSummary};
pub use worker::{DeliveryWorker, JobOutcome, PassStats};
