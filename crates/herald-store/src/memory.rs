//! In-memory repository with optional JSON snapshot persistence.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    Campaign, CampaignFilter, CampaignId, CampaignPatch, CampaignStatus, Client, ClientId,
    ClientPatch, Message, MessageId, MessageStatus, NewCampaign, NewClient, Repository, StoreError,
};

/// Last issued id per entity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct IdCounters {
    campaign: u64,
    client: u64,
    message: u64,
}

#[derive(Debug, Clone, Default)]
struct State {
    campaigns: BTreeMap<CampaignId, Campaign>,
    clients: BTreeMap<ClientId, Client>,
    messages: BTreeMap<MessageId, Message>,
    ids: IdCounters,
}

/// On-disk form of [`State`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    campaigns: Vec<Campaign>,
    #[serde(default)]
    clients: Vec<Client>,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    ids: IdCounters,
}

impl From<Snapshot> for State {
    fn from(snapshot: Snapshot) -> Self {
        let campaigns: BTreeMap<_, _> = snapshot.campaigns.into_iter().map(|c| (c.id, c)).collect();
        let clients: BTreeMap<_, _> = snapshot.clients.into_iter().map(|c| (c.id, c)).collect();
        let messages: BTreeMap<_, _> = snapshot.messages.into_iter().map(|m| (m.id, m)).collect();

        // Never reissue an id that is already present, even with a stale counter.
        let ids = IdCounters {
            campaign: snapshot
                .ids
                .campaign
                .max(campaigns.keys().last().map_or(0, |id| id.0)),
            client: snapshot
                .ids
                .client
                .max(clients.keys().last().map_or(0, |id| id.0)),
            message: snapshot
                .ids
                .message
                .max(messages.keys().last().map_or(0, |id| id.0)),
        };

        Self {
            campaigns,
            clients,
            messages,
            ids,
        }
    }
}

impl State {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            campaigns: self.campaigns.values().cloned().collect(),
            clients: self.clients.values().cloned().collect(),
            messages: self.messages.values().cloned().collect(),
            ids: self.ids,
        }
    }

    fn campaign_mut(&mut self, id: CampaignId) -> Result<&mut Campaign, StoreError> {
        self.campaigns
            .get_mut(&id)
            .ok_or_else(|| StoreError::campaign(id.0))
    }
}

/// Repository holding all entities in memory.
///
/// When opened with a snapshot path, every mutation is applied to a copy of
/// the state, written atomically (temporary file in the same directory, then
/// rename) and only then made visible. A failed write leaves the repository
/// exactly as it was.
///
/// A writable snapshot is owned by one process at a time through an exclusive
/// lock on `<snapshot>.lock`.
pub struct MemoryRepository {
    state: RwLock<State>,
    snapshot_path: Option<PathBuf>,
    _lock: Option<File>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    /// Create an empty, purely in-memory repository.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            snapshot_path: None,
            _lock: None,
        }
    }

    /// Open a repository backed by a snapshot file, loading it if it exists.
    ///
    /// Fails with [`StoreError::Locked`] while another repository has the
    /// same snapshot open.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let lock = acquire_lock(&path)?;
        let state = load(&path)?;

        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(path),
            _lock: Some(lock),
        })
    }

    /// Load a snapshot without taking ownership of it.
    ///
    /// Mutations on the returned repository are never written back.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let state = load(path.as_ref())?;
        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: None,
            _lock: None,
        })
    }

    /// Path of the backing snapshot, if any.
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Run `change` against the state and publish the result once it is on disk.
    async fn commit<T, F>(&self, state: &mut State, change: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut State) -> Result<T, StoreError> + Send,
    {
        let Some(path) = &self.snapshot_path else {
            return change(state);
        };

        let mut next = state.clone();
        let out = change(&mut next)?;

        let bytes = serde_json::to_vec_pretty(&next.snapshot())?;
        let path = path.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&path, &bytes))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;

        *state = next;
        Ok(out)
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn acquire_lock(path: &Path) -> Result<File, StoreError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(path))?;
    file.try_lock_exclusive()
        .map_err(|_| StoreError::Locked {
            path: path.to_path_buf(),
        })?;
    Ok(file)
}

fn load(path: &Path) -> Result<State, StoreError> {
    if !path.exists() {
        info!(path = %path.display(), "no snapshot found, starting empty");
        return Ok(State::default());
    }

    let bytes = std::fs::read(path)?;
    let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
    let state = State::from(snapshot);
    info!(
        path = %path.display(),
        campaigns = state.campaigns.len(),
        clients = state.clients.len(),
        messages = state.messages.len(),
        "loaded snapshot"
    );
    Ok(state)
}

fn write_snapshot(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list_campaigns(&self) -> Result<Vec<Campaign>, StoreError> {
        Ok(self.state.read().await.campaigns.values().cloned().collect())
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        Ok(self.state.read().await.campaigns.get(&id).cloned())
    }

    async fn insert_campaign(&self, campaign: NewCampaign) -> Result<Campaign, StoreError> {
        let mut state = self.state.write().await;
        self.commit(&mut state, |state| {
            state.ids.campaign += 1;
            let campaign = Campaign {
                id: CampaignId(state.ids.campaign),
                start_date: campaign.start_date,
                end_date: campaign.end_date,
                text: campaign.text,
                filter: campaign.filter,
                status: CampaignStatus::Created,
            };
            state.campaigns.insert(campaign.id, campaign.clone());
            Ok(campaign)
        })
        .await
    }

    async fn update_campaign(
        &self,
        id: CampaignId,
        patch: &CampaignPatch,
    ) -> Result<Campaign, StoreError> {
        let mut state = self.state.write().await;
        self.commit(&mut state, |state| {
            let campaign = state.campaign_mut(id)?;
            let updated = patch.apply(campaign)?;
            *campaign = updated.clone();
            Ok(updated)
        })
        .await
    }

    async fn delete_campaign(&self, id: CampaignId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.campaigns.contains_key(&id) {
            return Err(StoreError::campaign(id.0));
        }
        self.commit(&mut state, |state| {
            state.campaigns.remove(&id);
            state.messages.retain(|_, m| m.campaign_id != id);
            Ok(())
        })
        .await
    }

    async fn set_campaign_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.campaign_mut(id)?.status == status {
            return Ok(());
        }
        self.commit(&mut state, |state| {
            state.campaign_mut(id)?.status = status;
            Ok(())
        })
        .await
    }

    async fn start_campaign(
        &self,
        id: CampaignId,
        recipients: &[ClientId],
    ) -> Result<Option<Vec<Message>>, StoreError> {
        let mut state = self.state.write().await;
        if state.campaign_mut(id)?.status != CampaignStatus::Created {
            return Ok(None);
        }

        let created = self
            .commit(&mut state, |state| {
                state.campaign_mut(id)?.status = CampaignStatus::Started;

                let mut created = Vec::with_capacity(recipients.len());
                for client_id in recipients {
                    state.ids.message += 1;
                    let message = Message {
                        id: MessageId(state.ids.message),
                        campaign_id: id,
                        client_id: *client_id,
                        status: MessageStatus::Created,
                        sending_time: None,
                    };
                    state.messages.insert(message.id, message.clone());
                    created.push(message);
                }
                Ok(created)
            })
            .await?;

        debug!(campaign_id = %id, messages = created.len(), "campaign expanded");
        Ok(Some(created))
    }

    async fn list_clients(&self) -> Result<Vec<Client>, StoreError> {
        Ok(self.state.read().await.clients.values().cloned().collect())
    }

    async fn get_client(&self, id: ClientId) -> Result<Option<Client>, StoreError> {
        Ok(self.state.read().await.clients.get(&id).cloned())
    }

    async fn insert_client(&self, client: NewClient) -> Result<Client, StoreError> {
        let mut state = self.state.write().await;
        self.commit(&mut state, |state| {
            state.ids.client += 1;
            let client = Client {
                id: ClientId(state.ids.client),
                phone_number: client.phone_number,
                mobile_operator: client.mobile_operator,
                tag: client.tag,
                time_zone: client.time_zone,
            };
            state.clients.insert(client.id, client.clone());
            Ok(client)
        })
        .await
    }

    async fn update_client(
        &self,
        id: ClientId,
        patch: &ClientPatch,
    ) -> Result<Client, StoreError> {
        let mut state = self.state.write().await;
        self.commit(&mut state, |state| {
            let client = state
                .clients
                .get_mut(&id)
                .ok_or_else(|| StoreError::client(id.0))?;
            let updated = patch.apply(client)?;
            *client = updated.clone();
            Ok(updated)
        })
        .await
    }

    async fn delete_client(&self, id: ClientId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.clients.contains_key(&id) {
            return Err(StoreError::client(id.0));
        }
        self.commit(&mut state, |state| {
            state.clients.remove(&id);
            Ok(())
        })
        .await
    }

    async fn clients_matching(&self, filter: &CampaignFilter) -> Result<Vec<Client>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .clients
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    async fn messages_for_campaign(&self, id: CampaignId) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .messages
            .values()
            .filter(|m| m.campaign_id == id)
            .cloned()
            .collect())
    }

    async fn mark_message_sent(
        &self,
        id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .get(&id)
            .ok_or_else(|| StoreError::message(id.0))?;
        if message.status != MessageStatus::Created {
            return Ok(false);
        }
        self.commit(&mut state, |state| {
            if let Some(message) = state.messages.get_mut(&id) {
                message.status = MessageStatus::Sent;
                message.sending_time = Some(at);
            }
            Ok(true)
        })
        .await
    }
}
