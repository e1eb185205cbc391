//! Per-campaign mutual exclusion.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use herald_store::CampaignId;

/// One async mutex per campaign.
///
/// Held by the delivery worker for a whole fan-out + delivery pass, and by
/// the campaign service while it checks and mutates a `created` campaign.
/// Two holders of the same campaign's lock never overlap within a process.
#[derive(Clone, Default)]
pub struct CampaignLocks {
    locks: Arc<DashMap<CampaignId, Arc<Mutex<()>>>>,
}

impl CampaignLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock of `id`.
    pub async fn acquire(&self, id: CampaignId) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the shard guard is released before awaiting.
        let lock = Arc::clone(self.locks.entry(id).or_default().value());
        lock.lock_owned().await
    }

    /// Drop the lock entry of a campaign that needs no further coordination.
    ///
    /// The entry is kept while anyone still holds or waits on it, so a later
    /// `acquire` never gets a fresh mutex alongside a live one.
    pub fn forget(&self, id: CampaignId) {
        self.locks
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
