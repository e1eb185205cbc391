//! Error types for the scheduler.

use thiserror::Error;

use herald_store::{CampaignId, CampaignStatus, StoreError};

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Repository error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Campaign not found.
    #[error("campaign not found: {0}")]
    CampaignNotFound(CampaignId),

    /// Campaign has left `created` and can no longer be edited or deleted.
    #[error("campaign {id} is {status} and can no longer be changed")]
    NotEditable {
        id: CampaignId,
        status: CampaignStatus,
    },

    /// Invalid request.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Dispatch queue has shut down.
    #[error("dispatch queue closed")]
    QueueClosed,
}

impl SchedulerError {
    /// Whether the caller should see this as a rejected request rather than
    /// an engine failure.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::CampaignNotFound(_) | Self::NotEditable { .. } | Self::Invalid(_) => true,
            Self::Store(e) => matches!(e, StoreError::NotFound { .. } | StoreError::Invalid(_)),
            Self::QueueClosed => false,
        }
    }
}
