//! Campaign status reconciliation from aggregate message state.

use std::sync::Arc;

use tracing::info;

use herald_store::{CampaignId, CampaignStatus, Message, Repository};

use crate::SchedulerError;

/// Compute a campaign's status from its messages.
///
/// `created` (not expanded yet), `finished` and `expired` are returned
/// unchanged. Otherwise the campaign is `finished` when every message is
/// sent and `unfinished` when at least one is still outstanding. Never
/// produces `expired`; only the poller does that.
pub fn reconcile(status: CampaignStatus, messages: &[Message]) -> CampaignStatus {
    match status {
        CampaignStatus::Created | CampaignStatus::Finished | CampaignStatus::Expired => status,
        CampaignStatus::Started | CampaignStatus::Unfinished => {
            if messages.iter().all(Message::is_sent) {
                CampaignStatus::Finished
            } else {
                CampaignStatus::Unfinished
            }
        }
    }
}

/// Applies [`reconcile`] to stored campaigns.
pub struct Reconciler {
    repo: Arc<dyn Repository>,
}

impl Reconciler {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Recompute and store the status of one campaign, returning the result.
    pub async fn reconcile(&self, id: CampaignId) -> Result<CampaignStatus, SchedulerError> {
        let campaign = self
            .repo
            .get_campaign(id)
            .await?
            .ok_or(SchedulerError::CampaignNotFound(id))?;

        if matches!(
            campaign.status,
            CampaignStatus::Created | CampaignStatus::Finished | CampaignStatus::Expired
        ) {
            return Ok(campaign.status);
        }

        let messages = self.repo.messages_for_campaign(id).await?;
        let next = reconcile(campaign.status, &messages);

        if next != campaign.status {
            self.repo.set_campaign_status(id, next).await?;
            let sent = messages.iter().filter(|m| m.is_sent()).count();
            info!(
                campaign_id = %id,
                from = %campaign.status,
                to = %next,
                sent,
                total = messages.len(),
                "campaign status reconciled"
            );
        }

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use herald_store::{ClientId, MessageId, MessageStatus};
    use proptest::prelude::*;

    fn message(id: u64, sent: bool) -> Message {
        Message {
            id: MessageId(id),
            campaign_id: CampaignId(1),
            client_id: ClientId(id),
            status: if sent {
                MessageStatus::Sent
            } else {
                MessageStatus::Created
            },
            sending_time: sent.then(Utc::now),
        }
    }

    #[test]
    fn test_all_sent_finishes() {
        let messages = vec![message(1, true), message(2, true)];
        assert_eq!(
            reconcile(CampaignStatus::Started, &messages),
            CampaignStatus::Finished
        );
        assert_eq!(
            reconcile(CampaignStatus::Unfinished, &messages),
            CampaignStatus::Finished
        );
    }

    #[test]
    fn test_outstanding_message_keeps_unfinished() {
        let messages = vec![message(1, true), message(2, false)];
        assert_eq!(
            reconcile(CampaignStatus::Started, &messages),
            CampaignStatus::Unfinished
        );
    }

    #[test]
    fn test_no_recipients_finishes() {
        assert_eq!(
            reconcile(CampaignStatus::Started, &[]),
            CampaignStatus::Finished
        );
    }

    #[test]
    fn test_created_is_untouched() {
        let messages = vec![message(1, true)];
        assert_eq!(
            reconcile(CampaignStatus::Created, &messages),
            CampaignStatus::Created
        );
    }

    fn status() -> impl Strategy<Value = CampaignStatus> {
        prop_oneof![
            Just(CampaignStatus::Created),
            Just(CampaignStatus::Started),
            Just(CampaignStatus::Unfinished),
            Just(CampaignStatus::Finished),
            Just(CampaignStatus::Expired),
        ]
    }

    fn messages() -> impl Strategy<Value = Vec<Message>> {
        prop::collection::vec(any::<bool>(), 0..20).prop_map(|flags| {
            flags
                .into_iter()
                .enumerate()
                .map(|(i, sent)| message(i as u64 + 1, sent))
                .collect()
        })
    }

    proptest! {
        // Reconciliation never produces expired
        #[test]
        fn never_expires(status in status(), messages in messages()) {
            let next = reconcile(status, &messages);
            prop_assert!(next != CampaignStatus::Expired || status == CampaignStatus::Expired);
        }

        // An outstanding message always blocks finishing
        #[test]
        fn unsent_message_never_finishes(
            status in prop_oneof![Just(CampaignStatus::Started), Just(CampaignStatus::Unfinished)],
            mut messages in messages(),
        ) {
            messages.push(message(999, false));
            prop_assert_eq!(reconcile(status, &messages), CampaignStatus::Unfinished);
        }

        // Fully sent campaigns in delivery always finish
        #[test]
        fn all_sent_always_finishes(
            status in prop_oneof![Just(CampaignStatus::Started), Just(CampaignStatus::Unfinished)],
            count in 0usize..20,
        ) {
            let messages: Vec<_> = (1..=count as u64).map(|i| message(i, true)).collect();
            prop_assert_eq!(reconcile(status, &messages), CampaignStatus::Finished);
        }

        // Terminal statuses are fixed points
        #[test]
        fn terminal_is_fixed(messages in messages()) {
            prop_assert_eq!(
                reconcile(CampaignStatus::Finished, &messages),
                CampaignStatus::Finished
            );
            prop_assert_eq!(
                reconcile(CampaignStatus::Expired, &messages),
                CampaignStatus::Expired
            );
        }
    }
}
