//! The persistence boundary the scheduling engine is written against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    Campaign, CampaignFilter, CampaignId, CampaignPatch, CampaignStatus, Client, ClientId,
    ClientPatch, Message, MessageId, NewCampaign, NewClient, StoreError,
};

/// Storage of campaigns, clients and messages.
///
/// Point lookups return `Ok(None)` for unknown ids. Mutations of unknown ids
/// return [`StoreError::NotFound`].
#[async_trait]
pub trait Repository: Send + Sync {
    async fn list_campaigns(&self) -> Result<Vec<Campaign>, StoreError>;

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError>;

    async fn insert_campaign(&self, campaign: NewCampaign) -> Result<Campaign, StoreError>;

    async fn update_campaign(
        &self,
        id: CampaignId,
        patch: &CampaignPatch,
    ) -> Result<Campaign, StoreError>;

    async fn delete_campaign(&self, id: CampaignId) -> Result<(), StoreError>;

    async fn set_campaign_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
    ) -> Result<(), StoreError>;

    /// Expand a campaign into one message per recipient and mark it started.
    ///
    /// The message batch and the status change are applied together, and only
    /// if the campaign is still `created`. Returns `None` (and changes nothing)
    /// when the campaign has already been expanded.
    async fn start_campaign(
        &self,
        id: CampaignId,
        recipients: &[ClientId],
    ) -> Result<Option<Vec<Message>>, StoreError>;

    async fn list_clients(&self) -> Result<Vec<Client>, StoreError>;

    async fn get_client(&self, id: ClientId) -> Result<Option<Client>, StoreError>;

    async fn insert_client(&self, client: NewClient) -> Result<Client, StoreError>;

    async fn update_client(&self, id: ClientId, patch: &ClientPatch)
    -> Result<Client, StoreError>;

    async fn delete_client(&self, id: ClientId) -> Result<(), StoreError>;

    /// Clients selected by a campaign filter, ordered by id.
    async fn clients_matching(&self, filter: &CampaignFilter) -> Result<Vec<Client>, StoreError>;

    /// All messages of a campaign, ordered by id.
    async fn messages_for_campaign(&self, id: CampaignId) -> Result<Vec<Message>, StoreError>;

    /// Mark a message sent if, and only if, it is still `created`.
    ///
    /// Returns `true` when this call performed the transition.
    async fn mark_message_sent(&self, id: MessageId, at: DateTime<Utc>)
    -> Result<bool, StoreError>;
}
