//! Scheduling poller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use herald_store::{Campaign, CampaignStatus, Repository};

use crate::queue::{DispatchJob, DispatchQueue, SubmitOutcome};
use crate::{CampaignLocks, SchedulerError};

/// Counters of one poller tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Campaigns submitted to the dispatch queue.
    pub scheduled: usize,
    /// Campaigns marked expired.
    pub expired: usize,
    /// Campaigns whose evaluation failed; retried next tick.
    pub failed: usize,
}

enum Action {
    Skipped,
    Scheduled,
    Expired,
}

/// Periodically submits campaigns with an open window and expires campaigns
/// whose window closed before they finished.
pub struct Poller {
    repo: Arc<dyn Repository>,
    queue: DispatchQueue,
    locks: CampaignLocks,
    poll_interval: Duration,
    /// Set until the first tick completes. The first tick also picks up
    /// `started` campaigns, whose job may have been lost with the previous
    /// process.
    first_run: bool,
}

impl Poller {
    pub fn new(
        repo: Arc<dyn Repository>,
        queue: DispatchQueue,
        locks: CampaignLocks,
        poll_interval: Duration,
    ) -> Self {
        Self {
            repo,
            queue,
            locks,
            poll_interval,
            first_run: true,
        }
    }

    pub fn is_first_run(&self) -> bool {
        self.first_run
    }

    fn is_required(&self, status: CampaignStatus) -> bool {
        match status {
            CampaignStatus::Created | CampaignStatus::Unfinished => true,
            CampaignStatus::Started => self.first_run,
            CampaignStatus::Finished | CampaignStatus::Expired => false,
        }
    }

    /// Run one tick against the current time.
    pub async fn tick(&mut self) -> Result<TickReport, SchedulerError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as if the current time were `now`.
    ///
    /// Only listing the campaigns can fail the tick. Failures on a single
    /// campaign are logged and counted.
    #[tracing::instrument(skip(self), fields(first_run = self.first_run))]
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let campaigns = self.repo.list_campaigns().await?;
        let mut report = TickReport::default();

        for campaign in campaigns
            .into_iter()
            .filter(|c| self.is_required(c.status))
        {
            match self.evaluate(&campaign, now).await {
                Ok(Action::Skipped) => {}
                Ok(Action::Scheduled) => report.scheduled += 1,
                Ok(Action::Expired) => report.expired += 1,
                Err(e) => {
                    warn!(campaign_id = %campaign.id, error = %e, "failed to evaluate campaign");
                    report.failed += 1;
                }
            }
        }

        self.first_run = false;

        if report != TickReport::default() {
            info!(
                scheduled = report.scheduled,
                expired = report.expired,
                failed = report.failed,
                "poller tick complete"
            );
        }

        Ok(report)
    }

    async fn evaluate(
        &self,
        campaign: &Campaign,
        now: DateTime<Utc>,
    ) -> Result<Action, SchedulerError> {
        if now < campaign.start_date {
            return Ok(Action::Skipped);
        }

        if campaign.window_closed(now) {
            return self.expire(campaign).await;
        }

        let job = DispatchJob::new(campaign.id, campaign.start_date, campaign.end_date);
        match self.queue.submit(job).await? {
            SubmitOutcome::Expired => Ok(Action::Skipped),
            outcome => {
                debug!(campaign_id = %campaign.id, ?outcome, "campaign submitted");
                Ok(Action::Scheduled)
            }
        }
    }

    async fn expire(&self, campaign: &Campaign) -> Result<Action, SchedulerError> {
        let action = {
            let _guard = self.locks.acquire(campaign.id).await;
            self.expire_locked(campaign).await?
        };

        // A closed window never schedules more work for this campaign.
        self.locks.forget(campaign.id);
        Ok(action)
    }

    async fn expire_locked(&self, campaign: &Campaign) -> Result<Action, SchedulerError> {
        // A delivery pass may have finished the campaign since it was listed.
        let Some(current) = self.repo.get_campaign(campaign.id).await? else {
            return Ok(Action::Skipped);
        };
        if !self.is_required(current.status) {
            return Ok(Action::Skipped);
        }

        self.repo
            .set_campaign_status(campaign.id, CampaignStatus::Expired)
            .await?;
        self.queue.cancel(campaign.id).await;

        info!(
            campaign_id = %campaign.id,
            from = %current.status,
            end_date = %current.end_date,
            "campaign expired"
        );
        Ok(Action::Expired)
    }

    /// Tick every `poll_interval` until shutdown is signalled.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.poll_interval.as_secs(), "poller started");
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }

                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "poller tick failed");
                    }
                }
            }
        }

        info!("poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use herald_store::{CampaignFilter, CampaignId, MemoryRepository, NewCampaign};
    use pretty_assertions::assert_eq;

    use crate::queue::ReadyJobs;

    fn poller() -> (Arc<MemoryRepository>, DispatchQueue, ReadyJobs, Poller) {
        let repo = Arc::new(MemoryRepository::new());
        let (queue, ready) = DispatchQueue::new(8);
        let poller = Poller::new(
            repo.clone(),
            queue.clone(),
            CampaignLocks::new(),
            Duration::from_secs(15),
        );
        (repo, queue, ready, poller)
    }

    async fn add_campaign(
        repo: &MemoryRepository,
        now: DateTime<Utc>,
        start_offset_secs: i64,
        end_offset_secs: i64,
    ) -> CampaignId {
        repo.insert_campaign(NewCampaign::new(
            now + ChronoDuration::seconds(start_offset_secs),
            now + ChronoDuration::seconds(end_offset_secs),
            "hello",
            CampaignFilter::default(),
        ))
        .await
        .unwrap()
        .id
    }

    async fn status(repo: &MemoryRepository, id: CampaignId) -> CampaignStatus {
        repo.get_campaign(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_open_window_is_scheduled() {
        let (repo, queue, _ready, mut poller) = poller();
        let now = Utc::now();
        let id = add_campaign(&repo, now, 60, 3600).await;

        // Evaluated two minutes ahead, when the window is open
        let report = poller
            .tick_at(now + ChronoDuration::seconds(120))
            .await
            .unwrap();

        assert_eq!(
            report,
            TickReport {
                scheduled: 1,
                expired: 0,
                failed: 0,
            }
        );
        assert!(queue.is_pending(id).await);
        assert_eq!(status(&repo, id).await, CampaignStatus::Created);
    }

    #[tokio::test]
    async fn test_future_window_is_skipped() {
        let (repo, queue, _ready, mut poller) = poller();
        let now = Utc::now();
        let id = add_campaign(&repo, now, 600, 3600).await;

        let report = poller.tick_at(now).await.unwrap();

        assert_eq!(report, TickReport::default());
        assert!(!queue.is_pending(id).await);
    }

    #[tokio::test]
    async fn test_closed_window_expires() {
        let (repo, queue, _ready, mut poller) = poller();
        let now = Utc::now();
        let id = add_campaign(&repo, now, -120, -60).await;

        let report = poller.tick_at(now).await.unwrap();

        assert_eq!(report.expired, 1);
        assert_eq!(status(&repo, id).await, CampaignStatus::Expired);
        assert!(!queue.is_pending(id).await);
        assert!(repo.messages_for_campaign(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expiry_releases_lock_entry() {
        let repo = Arc::new(MemoryRepository::new());
        let (queue, _ready) = DispatchQueue::new(8);
        let locks = CampaignLocks::new();
        let mut poller = Poller::new(repo.clone(), queue, locks.clone(), Duration::from_secs(15));
        let now = Utc::now();
        let id = add_campaign(&repo, now, -120, -60).await;

        let report = poller.tick_at(now).await.unwrap();

        assert_eq!(report.expired, 1);
        assert_eq!(status(&repo, id).await, CampaignStatus::Expired);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_unfinished_campaign_expires_at_end_date() {
        let (repo, _queue, _ready, mut poller) = poller();
        let now = Utc::now();
        let id = add_campaign(&repo, now, -60, 60).await;
        repo.set_campaign_status(id, CampaignStatus::Unfinished)
            .await
            .unwrap();

        let report = poller
            .tick_at(now + ChronoDuration::seconds(60))
            .await
            .unwrap();

        assert_eq!(report.expired, 1);
        assert_eq!(status(&repo, id).await, CampaignStatus::Expired);
    }

    #[tokio::test]
    async fn test_terminal_campaigns_are_ignored() {
        let (repo, _queue, _ready, mut poller) = poller();
        let now = Utc::now();
        let finished = add_campaign(&repo, now, -120, -60).await;
        repo.set_campaign_status(finished, CampaignStatus::Finished)
            .await
            .unwrap();

        let report = poller.tick_at(now).await.unwrap();

        assert_eq!(report, TickReport::default());
        assert_eq!(status(&repo, finished).await, CampaignStatus::Finished);
    }

    #[tokio::test]
    async fn test_started_only_recovered_on_first_tick() {
        let (repo, queue, _ready, mut poller) = poller();
        let now = Utc::now();
        let id = add_campaign(&repo, now, -60, 3600).await;
        repo.start_campaign(id, &[]).await.unwrap();
        assert!(poller.is_first_run());

        let first = poller.tick_at(now).await.unwrap();
        assert_eq!(first.scheduled, 1);
        assert!(!poller.is_first_run());

        queue.cancel(id).await;
        let second = poller.tick_at(now).await.unwrap();
        assert_eq!(second, TickReport::default());
        assert!(!queue.is_pending(id).await);
    }

    #[tokio::test]
    async fn test_closed_queue_counts_as_failure() {
        let (repo, _queue, ready, mut poller) = poller();
        let now = Utc::now();
        add_campaign(&repo, now, -60, 3600).await;
        let expired = add_campaign(&repo, now, -120, -60).await;
        drop(ready);

        let report = poller.tick_at(now).await.unwrap();

        // The submit failure does not stop the other campaign from expiring
        assert_eq!(
            report,
            TickReport {
                scheduled: 0,
                expired: 1,
                failed: 1,
            }
        );
        assert_eq!(status(&repo, expired).await, CampaignStatus::Expired);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_repo, _queue, _ready, poller) = poller();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(poller.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
