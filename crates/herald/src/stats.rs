//! Stats command: print delivery statistics.

use std::path::Path;
use std::sync::Arc;

use miette::Result;

use herald_scheduler::{CampaignLocks, CampaignService, DispatchQueue};
use herald_store::{CampaignId, MemoryRepository};

pub async fn run(data_file: &Path, campaign: Option<u64>, detailed: bool) -> Result<()> {
    if !data_file.exists() {
        return Err(miette::miette!(
            "data file {} does not exist",
            data_file.display()
        ));
    }

    let repo =
        MemoryRepository::open_read_only(data_file).map_err(|e| miette::miette!("{}", e))?;
    let (queue, _ready) = DispatchQueue::new(1);
    let service = CampaignService::new(Arc::new(repo), queue, CampaignLocks::new());

    let json = match campaign {
        Some(id) => {
            let stats = service
                .campaign_stats(CampaignId(id), detailed)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            serde_json::to_string_pretty(&stats)
        }
        None => {
            let summary = service
                .summary()
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            serde_json::to_string_pretty(&summary)
        }
    }
    .map_err(|e| miette::miette!("failed to render statistics: {}", e))?;

    println!("{json}");
    Ok(())
}
