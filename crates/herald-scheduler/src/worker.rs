//! Delivery worker: the dispatch queue's job handler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use tracing::{debug, error, info, warn};

use herald_gateway::{DeliveryRequest, MessageGateway};
use herald_store::{Campaign, CampaignId, CampaignStatus, ClientId, Message, Repository};

use crate::queue::{DispatchJob, DispatchQueue, JobHandler};
use crate::{CampaignLocks, Reconciler, SchedulerConfig, SchedulerError};

/// Counters of one delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Unsent messages the pass tried to deliver.
    pub attempted: usize,
    /// Messages this pass delivered and recorded as sent.
    pub sent: usize,
    /// Messages left unsent for a later pass.
    pub failed: usize,
    /// Messages whose client no longer exists.
    pub skipped: usize,
    /// Messages not attempted because the window closed during the pass.
    pub expired: usize,
}

/// What a job invocation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The campaign was deleted.
    Missing,
    /// The campaign is terminal or its window has closed, possibly during
    /// this pass with messages still outstanding.
    Closed,
    /// The window has not opened yet; the job was re-submitted for its start.
    Waiting,
    /// Every message is sent.
    Finished(PassStats),
    /// Some messages are still outstanding; the job was re-submitted.
    Unfinished(PassStats),
}

enum Delivery {
    Sent,
    AlreadySent,
    Failed,
    Skipped,
    WindowClosed,
}

/// Expands campaigns into messages, delivers unsent messages and drives the
/// campaign status forward.
pub struct DeliveryWorker {
    repo: Arc<dyn Repository>,
    gateway: Arc<dyn MessageGateway>,
    queue: DispatchQueue,
    locks: CampaignLocks,
    reconciler: Reconciler,
    retry_delay: Duration,
    concurrency: usize,
}

impl DeliveryWorker {
    pub fn new(
        repo: Arc<dyn Repository>,
        gateway: Arc<dyn MessageGateway>,
        queue: DispatchQueue,
        locks: CampaignLocks,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(Arc::clone(&repo)),
            repo,
            gateway,
            queue,
            locks,
            retry_delay: config.retry_delay,
            concurrency: config.delivery_concurrency.max(1),
        }
    }

    /// Run one job for a campaign: fan-out if needed, one delivery pass,
    /// reconciliation, and re-submission while work remains.
    ///
    /// The campaign's lock is held throughout, so two invocations for the
    /// same campaign never deliver concurrently. The lock entry is dropped
    /// once the campaign needs no further jobs.
    #[tracing::instrument(skip(self), fields(campaign_id = %id))]
    pub async fn run_job(&self, id: CampaignId) -> Result<JobOutcome, SchedulerError> {
        let outcome = {
            let _guard = self.locks.acquire(id).await;
            self.run_locked(id).await?
        };

        if matches!(
            outcome,
            JobOutcome::Missing | JobOutcome::Closed | JobOutcome::Finished(_)
        ) {
            self.locks.forget(id);
        }
        Ok(outcome)
    }

    async fn run_locked(&self, id: CampaignId) -> Result<JobOutcome, SchedulerError> {
        let now = Utc::now();

        let Some(campaign) = self.repo.get_campaign(id).await? else {
            warn!(campaign_id = %id, "campaign no longer exists, dropping job");
            return Ok(JobOutcome::Missing);
        };

        if campaign.status.is_terminal() || campaign.window_closed(now) {
            debug!(campaign_id = %id, status = %campaign.status, "campaign closed, nothing to do");
            return Ok(JobOutcome::Closed);
        }

        if now < campaign.start_date {
            self.resubmit(&campaign, campaign.start_date).await;
            return Ok(JobOutcome::Waiting);
        }

        if campaign.status == CampaignStatus::Created {
            self.fan_out(&campaign).await?;
        }

        let pass = self.deliver_pending(&campaign).await?;

        match self.reconciler.reconcile(id).await? {
            CampaignStatus::Finished => {
                info!(campaign_id = %id, sent = pass.sent, "campaign finished");
                Ok(JobOutcome::Finished(pass))
            }
            CampaignStatus::Unfinished if campaign.window_closed(Utc::now()) => {
                info!(
                    campaign_id = %id,
                    sent = pass.sent,
                    expired = pass.expired,
                    "window closed during delivery, leaving campaign to expire"
                );
                Ok(JobOutcome::Closed)
            }
            CampaignStatus::Unfinished => {
                info!(
                    campaign_id = %id,
                    sent = pass.sent,
                    failed = pass.failed,
                    skipped = pass.skipped,
                    "campaign unfinished, re-submitting"
                );
                self.resubmit(&campaign, Utc::now() + self.retry_delay)
                    .await;
                Ok(JobOutcome::Unfinished(pass))
            }
            _ => Ok(JobOutcome::Closed),
        }
    }

    /// Create one message per matching client and mark the campaign started.
    ///
    /// A no-op if the campaign has already been expanded.
    async fn fan_out(&self, campaign: &Campaign) -> Result<(), SchedulerError> {
        let recipients: Vec<ClientId> = self
            .repo
            .clients_matching(&campaign.filter)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        match self.repo.start_campaign(campaign.id, &recipients).await? {
            Some(messages) => info!(
                campaign_id = %campaign.id,
                recipients = messages.len(),
                filter_tag = %campaign.filter.tag,
                filter_mobile_operator = %campaign.filter.mobile_operator,
                "campaign fanned out"
            ),
            None => debug!(campaign_id = %campaign.id, "campaign already fanned out"),
        }
        Ok(())
    }

    /// Attempt delivery of every unsent message of the campaign.
    async fn deliver_pending(&self, campaign: &Campaign) -> Result<PassStats, SchedulerError> {
        let unsent: Vec<Message> = self
            .repo
            .messages_for_campaign(campaign.id)
            .await?
            .into_iter()
            .filter(|m| !m.is_sent())
            .collect();

        let mut stats = PassStats {
            attempted: unsent.len(),
            ..Default::default()
        };

        let results: Vec<Delivery> = stream::iter(unsent)
            .map(|message| self.deliver(campaign, message))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for result in results {
            match result {
                Delivery::Sent => stats.sent += 1,
                Delivery::AlreadySent => {}
                Delivery::Failed => stats.failed += 1,
                Delivery::Skipped => stats.skipped += 1,
                Delivery::WindowClosed => stats.expired += 1,
            }
        }

        Ok(stats)
    }

    /// Deliver one message unless the campaign window has closed.
    ///
    /// The recorded sending time is the instant the request was handed to
    /// the gateway, which always lies inside the window.
    async fn deliver(&self, campaign: &Campaign, message: Message) -> Delivery {
        let client = match self.repo.get_client(message.client_id).await {
            Ok(Some(client)) => client,
            Ok(None) => {
                warn!(
                    message_id = %message.id,
                    client_id = %message.client_id,
                    "client no longer exists, skipping message"
                );
                return Delivery::Skipped;
            }
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "failed to load client");
                return Delivery::Failed;
            }
        };

        let request = DeliveryRequest {
            message_id: message.id.0,
            phone_number: client.phone_number,
            text: campaign.text.clone(),
        };

        let dispatched_at = Utc::now();
        if campaign.window_closed(dispatched_at) {
            return Delivery::WindowClosed;
        }

        debug!(message_id = %message.id, phone = %request.phone_number, "sending message");
        if let Err(e) = self.gateway.send(&request).await {
            warn!(
                message_id = %message.id,
                client_id = %message.client_id,
                error = %e,
                "delivery failed, message left for a later pass"
            );
            return Delivery::Failed;
        }

        match self.repo.mark_message_sent(message.id, dispatched_at).await {
            Ok(true) => {
                info!(
                    message_id = %message.id,
                    client_id = %message.client_id,
                    "message sent"
                );
                Delivery::Sent
            }
            Ok(false) => {
                debug!(message_id = %message.id, "message already marked sent");
                Delivery::AlreadySent
            }
            Err(e) => {
                error!(
                    message_id = %message.id,
                    error = %e,
                    "message delivered but could not be recorded as sent"
                );
                Delivery::Failed
            }
        }
    }

    async fn resubmit(&self, campaign: &Campaign, not_before: DateTime<Utc>) {
        let job = DispatchJob::new(campaign.id, not_before, campaign.end_date);
        if let Err(e) = self.queue.submit(job).await {
            warn!(campaign_id = %campaign.id, error = %e, "failed to re-submit job");
        }
    }
}

#[async_trait]
impl JobHandler for DeliveryWorker {
    async fn handle(&self, job: DispatchJob) {
        match self.run_job(job.campaign_id).await {
            Ok(outcome) => debug!(campaign_id = %job.campaign_id, ?outcome, "job complete"),
            Err(e) => {
                error!(campaign_id = %job.campaign_id, error = %e, "delivery job failed, retrying later");
                let retry = DispatchJob::new(
                    job.campaign_id,
                    Utc::now() + self.retry_delay,
                    job.expires,
                );
                if let Err(e) = self.queue.submit(retry).await {
                    warn!(campaign_id = %job.campaign_id, error = %e, "failed to re-submit job");
                }
            }
        }
    }
}
