//! Error types for the store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in repository operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Entity referenced by a stale id.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: u64 },

    /// Entity failed validation.
    #[error("invalid {0}")]
    Invalid(String),

    /// Snapshot file could not be read or written.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot could not be encoded or decoded.
    #[error("snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot is already open for writing elsewhere.
    #[error("snapshot {} is in use by another herald process", .path.display())]
    Locked { path: PathBuf },

    /// Temporary snapshot could not be moved into place.
    #[error("snapshot persist error: {0}")]
    Persist(#[from] tempfile::PersistError),
}

impl StoreError {
    pub(crate) fn campaign(id: u64) -> Self {
        Self::NotFound {
            entity: "campaign",
            id,
        }
    }

    pub(crate) fn client(id: u64) -> Self {
        Self::NotFound {
            entity: "client",
            id,
        }
    }

    pub(crate) fn message(id: u64) -> Self {
        Self::NotFound {
            entity: "message",
            id,
        }
    }

    /// Whether this error means the referenced entity no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
