//! Data model and persistence boundary for Herald.
//!
//! This crate provides:
//! - Campaign, client and message entities with their status machines
//! - The recipient filter policy used during fan-out
//! - Partial-update value objects for status-gated edits
//! - The `Repository` trait the scheduling engine is written against
//! - An in-memory repository with optional atomic JSON snapshots

mod error;
mod memory;
mod repository;
mod types;

pub use error::StoreError;
pub use memory::MemoryRepository;
pub use repository::Repository;
pub use types::{
    Campaign, CampaignFilter, CampaignId, CampaignPatch, CampaignStatus, Client, ClientId,
    ClientPatch, Message, MessageId, MessageStatus, NewCampaign, NewClient, OPERATOR_ANY, TAG_ANY,
};
