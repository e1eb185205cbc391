//! Delayed, expiring, deduplicating job queue.
//!
//! A submitted job waits on its own timer until `not_before`, then moves to
//! the ready channel where a pool of executors picks it up. The campaign id
//! is the dedup key: submitting again for the same campaign cancels the
//! pending timer and replaces it. A job past `expires` is dropped at
//! submission, at release and at pick-up, so it never runs late.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use herald_store::CampaignId;

use crate::SchedulerError;

/// A request to run the delivery worker for one campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchJob {
    pub campaign_id: CampaignId,
    /// The job never runs before this instant.
    pub not_before: DateTime<Utc>,
    /// The job never runs at or after this instant.
    pub expires: DateTime<Utc>,
}

impl DispatchJob {
    pub fn new(
        campaign_id: CampaignId,
        not_before: DateTime<Utc>,
        expires: DateTime<Utc>,
    ) -> Self {
        Self {
            campaign_id,
            not_before,
            expires,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires
    }
}

/// Result of [`DispatchQueue::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// No job was pending for this campaign.
    Scheduled,
    /// A pending job for this campaign was cancelled and replaced.
    Replaced,
    /// The job was already past its expiry and was discarded.
    Expired,
}

/// Handler invoked by the executors for each released job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: DispatchJob);
}

struct PendingJob {
    ticket: u64,
    timer: JoinHandle<()>,
}

struct QueueInner {
    pending: Mutex<HashMap<CampaignId, PendingJob>>,
    ready_tx: mpsc::Sender<DispatchJob>,
    next_ticket: AtomicU64,
}

/// Submission side of the queue. Cheap to clone.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<QueueInner>,
}

/// Consumption side of the queue, shared by the executors.
pub struct ReadyJobs {
    rx: Arc<Mutex<mpsc::Receiver<DispatchJob>>>,
}

impl DispatchQueue {
    /// Create a queue whose ready channel holds up to `capacity` jobs.
    pub fn new(capacity: usize) -> (Self, ReadyJobs) {
        let (ready_tx, ready_rx) = mpsc::channel(capacity.max(1));
        let queue = Self {
            inner: Arc::new(QueueInner {
                pending: Mutex::new(HashMap::new()),
                ready_tx,
                next_ticket: AtomicU64::new(0),
            }),
        };
        let ready = ReadyJobs {
            rx: Arc::new(Mutex::new(ready_rx)),
        };
        (queue, ready)
    }

    /// Submit a job, replacing any pending job of the same campaign.
    pub async fn submit(&self, job: DispatchJob) -> Result<SubmitOutcome, SchedulerError> {
        if self.inner.ready_tx.is_closed() {
            return Err(SchedulerError::QueueClosed);
        }

        let mut pending = self.inner.pending.lock().await;

        let replaced = match pending.remove(&job.campaign_id) {
            Some(previous) => {
                previous.timer.abort();
                true
            }
            None => false,
        };

        if job.is_expired(Utc::now()) {
            debug!(campaign_id = %job.campaign_id, expires = %job.expires, "discarding expired job");
            return Ok(SubmitOutcome::Expired);
        }

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        // The timer cannot observe `pending` before the entry below is
        // inserted: it needs the lock this function still holds.
        let timer = tokio::spawn(release_when_due(Arc::clone(&self.inner), job, ticket));
        pending.insert(job.campaign_id, PendingJob { ticket, timer });

        debug!(
            campaign_id = %job.campaign_id,
            not_before = %job.not_before,
            expires = %job.expires,
            replaced,
            "job scheduled"
        );

        Ok(if replaced {
            SubmitOutcome::Replaced
        } else {
            SubmitOutcome::Scheduled
        })
    }

    /// Revoke the pending job of a campaign. Returns `true` if one was pending.
    pub async fn cancel(&self, campaign_id: CampaignId) -> bool {
        match self.inner.pending.lock().await.remove(&campaign_id) {
            Some(job) => {
                job.timer.abort();
                debug!(campaign_id = %campaign_id, "pending job cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether a job for `campaign_id` is waiting for its not-before time.
    pub async fn is_pending(&self, campaign_id: CampaignId) -> bool {
        self.inner.pending.lock().await.contains_key(&campaign_id)
    }

    /// Number of jobs waiting for their not-before time.
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

async fn release_when_due(inner: Arc<QueueInner>, job: DispatchJob, ticket: u64) {
    let delay = (job.not_before - Utc::now()).to_std().unwrap_or_default();
    if !delay.is_zero() {
        sleep(delay).await;
    }

    {
        let mut pending = inner.pending.lock().await;
        match pending.get(&job.campaign_id) {
            Some(entry) if entry.ticket == ticket => {
                pending.remove(&job.campaign_id);
            }
            // Replaced or cancelled while sleeping.
            _ => return,
        }
    }

    if job.is_expired(Utc::now()) {
        debug!(campaign_id = %job.campaign_id, "job expired before release");
        return;
    }

    if inner.ready_tx.send(job).await.is_err() {
        debug!(campaign_id = %job.campaign_id, "ready channel closed, dropping job");
    }
}

impl ReadyJobs {
    /// Take the next released job, skipping any that expired while queued.
    ///
    /// Returns `None` once every [`DispatchQueue`] handle is dropped.
    pub async fn next(&self) -> Option<DispatchJob> {
        loop {
            let job = self.rx.lock().await.recv().await?;
            if job.is_expired(Utc::now()) {
                debug!(campaign_id = %job.campaign_id, "job expired while queued");
                continue;
            }
            return Some(job);
        }
    }
}

impl Clone for ReadyJobs {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

/// Spawn `count` executors that run released jobs through `handler` until
/// shutdown is signalled or the queue is dropped.
pub fn spawn_workers(
    ready: ReadyJobs,
    count: usize,
    handler: Arc<dyn JobHandler>,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker_id| {
            let ready = ready.clone();
            let handler = Arc::clone(&handler);
            let mut shutdown_rx = shutdown_rx.clone();

            tokio::spawn(async move {
                info!(worker_id, "dispatch worker started");

                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }

                    let job = tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                            continue;
                        }
                        job = ready.next() => job,
                    };

                    let Some(job) = job else {
                        warn!(worker_id, "dispatch queue dropped");
                        break;
                    };

                    debug!(worker_id, campaign_id = %job.campaign_id, "worker picked up job");
                    handler.handle(job).await;
                }

                info!(worker_id, "dispatch worker stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tokio::time::timeout;

    fn job(id: u64, not_before_ms: i64, expires_ms: i64) -> DispatchJob {
        let now = Utc::now();
        DispatchJob::new(
            CampaignId(id),
            now + ChronoDuration::milliseconds(not_before_ms),
            now + ChronoDuration::milliseconds(expires_ms),
        )
    }

    #[tokio::test]
    async fn test_due_job_is_released() {
        let (queue, ready) = DispatchQueue::new(8);
        let outcome = queue.submit(job(1, -1000, 60_000)).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Scheduled);

        let released = timeout(Duration::from_secs(1), ready.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(released.campaign_id, CampaignId(1));
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_job_not_released_before_not_before() {
        let (queue, ready) = DispatchQueue::new(8);
        let submitted = job(1, 300, 60_000);
        queue.submit(submitted).await.unwrap();

        assert!(timeout(Duration::from_millis(100), ready.next()).await.is_err());
        assert!(queue.is_pending(CampaignId(1)).await);

        let released = timeout(Duration::from_secs(2), ready.next())
            .await
            .unwrap()
            .unwrap();
        assert!(Utc::now() >= released.not_before);
    }

    #[tokio::test]
    async fn test_expired_job_is_discarded() {
        let (queue, ready) = DispatchQueue::new(8);
        let outcome = queue.submit(job(1, -2000, -1000)).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Expired);
        assert_eq!(queue.pending_count().await, 0);
        assert!(timeout(Duration::from_millis(100), ready.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_job_expiring_while_waiting_is_dropped() {
        let (queue, ready) = DispatchQueue::new(8);
        // Expires before it becomes due
        queue.submit(job(1, 200, 100)).await.unwrap();
        assert!(timeout(Duration::from_millis(400), ready.next()).await.is_err());
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_resubmission_replaces_pending_job() {
        let (queue, ready) = DispatchQueue::new(8);
        queue.submit(job(1, 10_000, 60_000)).await.unwrap();
        let outcome = queue.submit(job(1, -1000, 60_000)).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Replaced);

        let released = timeout(Duration::from_secs(1), ready.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(released.campaign_id, CampaignId(1));

        // The replaced timer never fires
        assert!(timeout(Duration::from_millis(100), ready.next()).await.is_err());
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_revokes_pending_job() {
        let (queue, ready) = DispatchQueue::new(8);
        queue.submit(job(1, 100, 60_000)).await.unwrap();
        assert!(queue.cancel(CampaignId(1)).await);
        assert!(!queue.cancel(CampaignId(1)).await);

        assert!(timeout(Duration::from_millis(300), ready.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_distinct_campaigns_do_not_dedup() {
        let (queue, _ready) = DispatchQueue::new(8);
        queue.submit(job(1, 10_000, 60_000)).await.unwrap();
        queue.submit(job(2, 10_000, 60_000)).await.unwrap();
        assert_eq!(queue.pending_count().await, 2);
    }

    struct Recorder {
        seen: Mutex<Vec<CampaignId>>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: DispatchJob) {
            self.seen.lock().await.push(job.campaign_id);
        }
    }

    #[tokio::test]
    async fn test_workers_run_jobs_and_stop_on_shutdown() {
        let (queue, ready) = DispatchQueue::new(8);
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = spawn_workers(ready, 2, recorder.clone(), shutdown_rx);

        queue.submit(job(1, -1, 60_000)).await.unwrap();
        queue.submit(job(2, -1, 60_000)).await.unwrap();

        for _ in 0..50 {
            if recorder.seen.lock().await.len() == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let mut seen = recorder.seen.lock().await.clone();
        seen.sort();
        assert_eq!(seen, vec![CampaignId(1), CampaignId(2)]);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        }
    }
}
