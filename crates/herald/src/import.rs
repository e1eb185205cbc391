//! Import command: load clients and campaigns from a JSON file.

use std::path::Path;
use std::sync::Arc;

use miette::Result;
use serde::Deserialize;
use tracing::info;

use herald_scheduler::{CampaignLocks, CampaignService, DispatchQueue, SchedulerError};
use herald_store::{MemoryRepository, NewCampaign, NewClient};

/// Contents of an import file.
#[derive(Debug, Default, Deserialize)]
pub struct ImportFile {
    #[serde(default)]
    pub clients: Vec<NewClient>,
    #[serde(default)]
    pub campaigns: Vec<NewCampaign>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportReport {
    pub clients: usize,
    pub campaigns: usize,
}

impl ImportFile {
    /// Check every entry before anything is written.
    fn validate(&self) -> Result<(), SchedulerError> {
        for (i, client) in self.clients.iter().enumerate() {
            client
                .validate()
                .map_err(|e| SchedulerError::Invalid(format!("clients[{i}]: {e}")))?;
        }
        for (i, campaign) in self.campaigns.iter().enumerate() {
            campaign
                .validate()
                .map_err(|e| SchedulerError::Invalid(format!("campaigns[{i}]: {e}")))?;
        }
        Ok(())
    }
}

/// Insert the file's clients, then its campaigns.
///
/// Nothing is inserted if any entry is invalid.
pub async fn import(
    service: &CampaignService,
    file: ImportFile,
) -> Result<ImportReport, SchedulerError> {
    file.validate()?;

    let mut report = ImportReport {
        clients: 0,
        campaigns: 0,
    };
    for client in file.clients {
        service.create_client(client).await?;
        report.clients += 1;
    }
    for campaign in file.campaigns {
        service.create_campaign(campaign).await?;
        report.campaigns += 1;
    }
    Ok(report)
}

pub async fn run(data_file: &Path, input: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(input)
        .map_err(|e| miette::miette!("failed to read {}: {}", input.display(), e))?;
    let file: ImportFile = serde_json::from_str(&raw)
        .map_err(|e| miette::miette!("failed to parse {}: {}", input.display(), e))?;

    let repo = MemoryRepository::open(data_file).map_err(|e| miette::miette!("{}", e))?;
    let (queue, _ready) = DispatchQueue::new(1);
    let service = CampaignService::new(Arc::new(repo), queue, CampaignLocks::new());

    let report = import(&service, file)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    info!(
        clients = report.clients,
        campaigns = report.campaigns,
        data_file = %data_file.display(),
        "import complete"
    );
    println!(
        "imported {} clients and {} campaigns",
        report.clients, report.campaigns
    );
    Ok(())
}
