//! Campaign and client management on top of the engine.
//!
//! Edits and deletions of a campaign are only allowed while it is `created`,
//! and both revoke its pending dispatch job. The status check and the
//! mutation run under the campaign's lock, so they cannot interleave with a
//! fan-out.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use herald_store::{
    Campaign, CampaignId, CampaignPatch, Client, ClientId, ClientPatch, Message, NewCampaign,
    NewClient, Repository, StoreError,
};

use crate::queue::DispatchQueue;
use crate::{CampaignLocks, SchedulerError};

/// Delivery statistics of one campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CampaignStats {
    pub campaign: Campaign,
    /// Messages created by fan-out.
    pub total: usize,
    /// Messages still waiting for delivery.
    pub created: usize,
    /// Messages delivered.
    pub sent: usize,
    /// Per-message detail, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
}

/// Statistics over all campaigns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub total_campaigns: usize,
    /// Campaign count per status.
    pub by_status: BTreeMap<&'static str, usize>,
    pub campaigns: Vec<CampaignStats>,
}

/// Entry point for creating, editing and inspecting campaigns and clients.
#[derive(Clone)]
pub struct CampaignService {
    repo: Arc<dyn Repository>,
    queue: DispatchQueue,
    locks: CampaignLocks,
}

impl CampaignService {
    pub fn new(repo: Arc<dyn Repository>, queue: DispatchQueue, locks: CampaignLocks) -> Self {
        Self { repo, queue, locks }
    }

    // === Campaigns ===

    pub async fn create_campaign(&self, campaign: NewCampaign) -> Result<Campaign, SchedulerError> {
        campaign.validate()?;
        let campaign = self.repo.insert_campaign(campaign).await?;
        info!(
            campaign_id = %campaign.id,
            start_date = %campaign.start_date,
            end_date = %campaign.end_date,
            "campaign created"
        );
        Ok(campaign)
    }

    pub async fn get_campaign(&self, id: CampaignId) -> Result<Campaign, SchedulerError> {
        self.repo
            .get_campaign(id)
            .await?
            .ok_or(SchedulerError::CampaignNotFound(id))
    }

    pub async fn list_campaigns(&self) -> Result<Vec<Campaign>, SchedulerError> {
        Ok(self.repo.list_campaigns().await?)
    }

    /// Apply a partial update to a `created` campaign.
    ///
    /// Its pending job is revoked; the poller resubmits it against the new
    /// window.
    pub async fn update_campaign(
        &self,
        id: CampaignId,
        patch: &CampaignPatch,
    ) -> Result<Campaign, SchedulerError> {
        let _guard = self.locks.acquire(id).await;
        let current = self.editable(id).await?;
        if patch.is_empty() {
            return Ok(current);
        }

        let updated = self.repo.update_campaign(id, patch).await?;
        let revoked = self.queue.cancel(id).await;
        info!(campaign_id = %id, revoked, "campaign updated");
        Ok(updated)
    }

    /// Delete a `created` campaign and revoke its pending job.
    pub async fn delete_campaign(&self, id: CampaignId) -> Result<(), SchedulerError> {
        {
            let _guard = self.locks.acquire(id).await;
            self.editable(id).await?;
            self.repo.delete_campaign(id).await?;
            let revoked = self.queue.cancel(id).await;
            info!(campaign_id = %id, revoked, "campaign deleted");
        }
        self.locks.forget(id);
        Ok(())
    }

    async fn editable(&self, id: CampaignId) -> Result<Campaign, SchedulerError> {
        let campaign = self.get_campaign(id).await?;
        if !campaign.status.is_editable() {
            return Err(SchedulerError::NotEditable {
                id,
                status: campaign.status,
            });
        }
        Ok(campaign)
    }

    // === Clients ===

    pub async fn create_client(&self, client: NewClient) -> Result<Client, SchedulerError> {
        client.validate()?;
        let client = self.repo.insert_client(client).await?;
        info!(client_id = %client.id, "client created");
        Ok(client)
    }

    pub async fn get_client(&self, id: ClientId) -> Result<Client, SchedulerError> {
        self.repo
            .get_client(id)
            .await?
            .ok_or(SchedulerError::Store(StoreError::NotFound {
                entity: "client",
                id: id.0,
            }))
    }

    pub async fn list_clients(&self) -> Result<Vec<Client>, SchedulerError> {
        Ok(self.repo.list_clients().await?)
    }

    pub async fn update_client(
        &self,
        id: ClientId,
        patch: &ClientPatch,
    ) -> Result<Client, SchedulerError> {
        let client = self.repo.update_client(id, patch).await?;
        info!(client_id = %id, "client updated");
        Ok(client)
    }

    /// Delete a client. Messages already addressed to it stay unsent.
    pub async fn delete_client(&self, id: ClientId) -> Result<(), SchedulerError> {
        self.repo.delete_client(id).await?;
        info!(client_id = %id, "client deleted");
        Ok(())
    }

    // === Statistics ===

    pub async fn campaign_stats(
        &self,
        id: CampaignId,
        detailed: bool,
    ) -> Result<CampaignStats, SchedulerError> {
        let campaign = self.get_campaign(id).await?;
        self.stats_for(campaign, detailed).await
    }

    pub async fn summary(&self) -> Result<StatsSummary, SchedulerError> {
        let campaigns = self.repo.list_campaigns().await?;

        let mut by_status = BTreeMap::new();
        let mut stats = Vec::with_capacity(campaigns.len());
        for campaign in campaigns {
            *by_status.entry(campaign.status.as_str()).or_insert(0) += 1;
            stats.push(self.stats_for(campaign, false).await?);
        }

        Ok(StatsSummary {
            total_campaigns: stats.len(),
            by_status,
            campaigns: stats,
        })
    }

    async fn stats_for(
        &self,
        campaign: Campaign,
        detailed: bool,
    ) -> Result<CampaignStats, SchedulerError> {
        let messages = self.repo.messages_for_campaign(campaign.id).await?;
        let sent = messages.iter().filter(|m| m.is_sent()).count();

        Ok(CampaignStats {
            campaign,
            total: messages.len(),
            created: messages.len() - sent,
            sent,
            messages: detailed.then_some(messages),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use herald_store::{CampaignFilter, CampaignStatus, MemoryRepository};
    use pretty_assertions::assert_eq;

    use crate::queue::{DispatchJob, ReadyJobs};

    fn service() -> (Arc<MemoryRepository>, DispatchQueue, ReadyJobs, CampaignService) {
        let repo = Arc::new(MemoryRepository::new());
        let (queue, ready) = DispatchQueue::new(8);
        let service = CampaignService::new(repo.clone(), queue.clone(), CampaignLocks::new());
        (repo, queue, ready, service)
    }

    fn new_campaign(start_offset_mins: i64) -> NewCampaign {
        let start = Utc::now() + Duration::minutes(start_offset_mins);
        NewCampaign::new(
            start,
            start + Duration::hours(1),
            "hello",
            CampaignFilter::default(),
        )
    }

    fn new_client(phone: &str) -> NewClient {
        NewClient {
            phone_number: phone.to_string(),
            mobile_operator: "900".to_string(),
            tag: None,
            time_zone: "Europe/Moscow".to_string(),
        }
    }

    async fn schedule(queue: &DispatchQueue, campaign: &Campaign) {
        queue
            .submit(DispatchJob::new(
                campaign.id,
                campaign.start_date,
                campaign.end_date,
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_campaign_validates() {
        let (_repo, _queue, _ready, service) = service();
        let mut invalid = new_campaign(10);
        invalid.end_date = invalid.start_date;

        let err = service.create_campaign(invalid).await.unwrap_err();
        assert!(err.is_client_error());
        assert!(service.list_campaigns().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_client_validates() {
        let (_repo, _queue, _ready, service) = service();
        let err = service
            .create_client(new_client("89001234567"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Store(StoreError::Invalid(_))));

        let client = service.create_client(new_client("79001234567")).await.unwrap();
        assert_eq!(service.get_client(client.id).await.unwrap(), client);
    }

    #[tokio::test]
    async fn test_update_created_campaign_cancels_job() {
        let (_repo, queue, _ready, service) = service();
        let campaign = service.create_campaign(new_campaign(10)).await.unwrap();
        schedule(&queue, &campaign).await;
        assert!(queue.is_pending(campaign.id).await);

        let patch = CampaignPatch {
            text: Some("updated".to_string()),
            ..Default::default()
        };
        let updated = service.update_campaign(campaign.id, &patch).await.unwrap();

        assert_eq!(updated.text, "updated");
        assert!(!queue.is_pending(campaign.id).await);
    }

    #[tokio::test]
    async fn test_update_started_campaign_is_rejected() {
        let (repo, _queue, _ready, service) = service();
        let campaign = service.create_campaign(new_campaign(-1)).await.unwrap();
        repo.start_campaign(campaign.id, &[]).await.unwrap();

        let patch = CampaignPatch {
            text: Some("updated".to_string()),
            ..Default::default()
        };
        let err = service
            .update_campaign(campaign.id, &patch)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SchedulerError::NotEditable {
                status: CampaignStatus::Started,
                ..
            }
        ));
        assert_eq!(service.get_campaign(campaign.id).await.unwrap().text, "hello");
    }

    #[tokio::test]
    async fn test_delete_created_campaign_cancels_job() {
        let (_repo, queue, _ready, service) = service();
        let campaign = service.create_campaign(new_campaign(10)).await.unwrap();
        schedule(&queue, &campaign).await;

        service.delete_campaign(campaign.id).await.unwrap();

        assert!(!queue.is_pending(campaign.id).await);
        assert!(matches!(
            service.get_campaign(campaign.id).await,
            Err(SchedulerError::CampaignNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_finished_campaign_is_rejected() {
        let (repo, _queue, _ready, service) = service();
        let campaign = service.create_campaign(new_campaign(-1)).await.unwrap();
        repo.set_campaign_status(campaign.id, CampaignStatus::Finished)
            .await
            .unwrap();

        let err = service.delete_campaign(campaign.id).await.unwrap_err();
        assert!(err.is_client_error());
        assert!(service.get_campaign(campaign.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_stats_count_messages() {
        let (repo, _queue, _ready, service) = service();
        let a = service.create_client(new_client("79000000001")).await.unwrap();
        let b = service.create_client(new_client("79000000002")).await.unwrap();
        let campaign = service.create_campaign(new_campaign(-1)).await.unwrap();
        let messages = repo
            .start_campaign(campaign.id, &[a.id, b.id])
            .await
            .unwrap()
            .unwrap();
        repo.mark_message_sent(messages[0].id, Utc::now())
            .await
            .unwrap();

        let stats = service.campaign_stats(campaign.id, false).await.unwrap();
        assert_eq!((stats.total, stats.created, stats.sent), (2, 1, 1));
        assert!(stats.messages.is_none());

        let detailed = service.campaign_stats(campaign.id, true).await.unwrap();
        assert_eq!(detailed.messages.map(|m| m.len()), Some(2));

        service.create_campaign(new_campaign(10)).await.unwrap();
        let summary = service.summary().await.unwrap();
        assert_eq!(summary.total_campaigns, 2);
        assert_eq!(summary.by_status.get("started"), Some(&1));
        assert_eq!(summary.by_status.get("created"), Some(&1));
    }

    #[tokio::test]
    async fn test_stats_serialize_without_detail() {
        let (_repo, _queue, _ready, service) = service();
        let campaign = service.create_campaign(new_campaign(10)).await.unwrap();

        let stats = service.campaign_stats(campaign.id, false).await.unwrap();
        let json = serde_json::to_value(&stats).unwrap();

        assert_eq!(json["total"], 0);
        assert_eq!(json["campaign"]["status"], "created");
        assert!(json.get("messages").is_none());
    }
}
