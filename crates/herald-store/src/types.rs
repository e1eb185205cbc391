//! Campaign, client and message types.

use std::fmt;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Tag filter sentinel meaning "any tag".
pub const TAG_ANY: &str = "all";

/// Mobile operator filter sentinel meaning "any operator".
pub const OPERATOR_ANY: &str = "000";

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Identity of a campaign. Also the dedup key of its dispatch job.
    CampaignId
);
entity_id!(
    /// Identity of a recipient.
    ClientId
);
entity_id!(
    /// Identity of a single (campaign, client) delivery.
    MessageId
);

/// Lifecycle of a campaign.
///
/// ```text
/// created --fan-out--> started --reconcile--> unfinished
/// started/unfinished --reconcile: all sent--> finished
/// created/unfinished --window closed--> expired
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Waiting for its window; recipients not yet expanded.
    #[default]
    Created,
    /// Recipients expanded, delivery in progress.
    Started,
    /// At least one delivery still outstanding after a pass.
    Unfinished,
    /// Every message sent.
    Finished,
    /// Window closed before every message was sent.
    Expired,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Unfinished => "unfinished",
            Self::Finished => "finished",
            Self::Expired => "expired",
        }
    }

    /// Finished and expired campaigns never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Expired)
    }

    /// Only campaigns that have not been expanded may be edited or deleted.
    pub fn is_editable(&self) -> bool {
        *self == Self::Created
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Created,
    Sent,
}

fn any_tag() -> String {
    TAG_ANY.to_string()
}

fn any_operator() -> String {
    OPERATOR_ANY.to_string()
}

/// Recipient filter of a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignFilter {
    /// Required client tag, or [`TAG_ANY`].
    #[serde(rename = "filter_tag", default = "any_tag")]
    pub tag: String,
    /// Required 3-character operator code, or [`OPERATOR_ANY`].
    #[serde(rename = "filter_mobile_operator", default = "any_operator")]
    pub mobile_operator: String,
}

impl Default for CampaignFilter {
    fn default() -> Self {
        Self {
            tag: any_tag(),
            mobile_operator: any_operator(),
        }
    }
}

impl CampaignFilter {
    pub fn new(tag: impl Into<String>, mobile_operator: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            mobile_operator: mobile_operator.into(),
        }
    }

    pub fn tag_active(&self) -> bool {
        self.tag != TAG_ANY
    }

    pub fn operator_active(&self) -> bool {
        self.mobile_operator != OPERATOR_ANY
    }

    /// Check whether a client is a recipient under this filter.
    pub fn matches(&self, client: &Client) -> bool {
        let tag_matches = || client.tag.as_deref() == Some(self.tag.as_str());
        let operator_matches = || client.mobile_operator == self.mobile_operator;

        match (self.tag_active(), self.operator_active()) {
            (true, true) => tag_matches() && operator_matches(),
            (true, false) => tag_matches(),
            (false, true) => operator_matches(),
            (false, false) => true,
        }
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.tag.trim().is_empty() {
            return Err(StoreError::Invalid(
                "campaign: tag filter must not be empty".to_string(),
            ));
        }
        if !is_operator_code(&self.mobile_operator) {
            return Err(StoreError::Invalid(format!(
                "campaign: mobile operator filter '{}' is not a 3-character code",
                self.mobile_operator
            )));
        }
        Ok(())
    }
}

/// A timed mass-messaging campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub text: String,
    #[serde(flatten)]
    pub filter: CampaignFilter,
    pub status: CampaignStatus,
}

impl Campaign {
    /// `start_date <= now < end_date`.
    pub fn window_open(&self, now: DateTime<Utc>) -> bool {
        self.start_date <= now && now < self.end_date
    }

    /// `now >= end_date`.
    pub fn window_closed(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_date
    }
}

/// A message recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    /// 11 digits, country code first.
    pub phone_number: String,
    pub mobile_operator: String,
    #[serde(default)]
    pub tag: Option<String>,
    /// IANA zone name.
    pub time_zone: String,
}

/// One delivery of a campaign to one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "distribution_id")]
    pub campaign_id: CampaignId,
    pub client_id: ClientId,
    pub status: MessageStatus,
    /// Set only when the message is sent.
    #[serde(default)]
    pub sending_time: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_sent(&self) -> bool {
        self.status == MessageStatus::Sent
    }
}

/// Payload for creating a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCampaign {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub text: String,
    #[serde(flatten)]
    pub filter: CampaignFilter,
}

impl NewCampaign {
    pub fn new(
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        text: impl Into<String>,
        filter: CampaignFilter,
    ) -> Self {
        Self {
            start_date,
            end_date,
            text: text.into(),
            filter,
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        validate_window(self.start_date, self.end_date)?;
        self.filter.validate()
    }
}

/// Payload for creating a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewClient {
    pub phone_number: String,
    pub mobile_operator: String,
    #[serde(default)]
    pub tag: Option<String>,
    pub time_zone: String,
}

impl NewClient {
    pub fn validate(&self) -> Result<(), StoreError> {
        validate_client_fields(&self.phone_number, &self.mobile_operator, &self.time_zone)
    }
}

/// Partial update of a campaign. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignPatch {
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub filter_tag: Option<String>,
    #[serde(default)]
    pub filter_mobile_operator: Option<String>,
}

impl CampaignPatch {
    pub fn is_empty(&self) -> bool {
        self.start_date.is_none()
            && self.end_date.is_none()
            && self.text.is_none()
            && self.filter_tag.is_none()
            && self.filter_mobile_operator.is_none()
    }

    /// Apply present fields to a copy of `campaign` and validate the result.
    pub fn apply(&self, campaign: &Campaign) -> Result<Campaign, StoreError> {
        let mut updated = campaign.clone();
        if let Some(start_date) = self.start_date {
            updated.start_date = start_date;
        }
        if let Some(end_date) = self.end_date {
            updated.end_date = end_date;
        }
        if let Some(text) = &self.text {
            updated.text = text.clone();
        }
        if let Some(tag) = &self.filter_tag {
            updated.filter.tag = tag.clone();
        }
        if let Some(operator) = &self.filter_mobile_operator {
            updated.filter.mobile_operator = operator.clone();
        }

        validate_window(updated.start_date, updated.end_date)?;
        updated.filter.validate()?;
        Ok(updated)
    }
}

/// Partial update of a client. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPatch {
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub mobile_operator: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>,
}

impl ClientPatch {
    /// Apply present fields to a copy of `client` and validate the result.
    pub fn apply(&self, client: &Client) -> Result<Client, StoreError> {
        let mut updated = client.clone();
        if let Some(phone_number) = &self.phone_number {
            updated.phone_number = phone_number.clone();
        }
        if let Some(operator) = &self.mobile_operator {
            updated.mobile_operator = operator.clone();
        }
        if let Some(tag) = &self.tag {
            updated.tag = Some(tag.clone());
        }
        if let Some(time_zone) = &self.time_zone {
            updated.time_zone = time_zone.clone();
        }

        validate_client_fields(
            &updated.phone_number,
            &updated.mobile_operator,
            &updated.time_zone,
        )?;
        Ok(updated)
    }
}

fn validate_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), StoreError> {
    if start >= end {
        return Err(StoreError::Invalid(format!(
            "campaign: start_date {} must be before end_date {}",
            start, end
        )));
    }
    Ok(())
}

fn validate_client_fields(phone: &str, operator: &str, time_zone: &str) -> Result<(), StoreError> {
    if phone.len() != 11 || !phone.starts_with('7') || !phone.bytes().all(|b| b.is_ascii_digit()) {
        return Err(StoreError::Invalid(format!(
            "client: phone number '{}' must be 11 digits starting with 7",
            phone
        )));
    }
    if !is_operator_code(operator) {
        return Err(StoreError::Invalid(format!(
            "client: mobile operator '{}' is not a 3-character code",
            operator
        )));
    }
    if time_zone.parse::<Tz>().is_err() {
        return Err(StoreError::Invalid(format!(
            "client: unknown time zone '{}'",
            time_zone
        )));
    }
    Ok(())
}

fn is_operator_code(code: &str) -> bool {
    code.len() == 3 && code.bytes().all(|b| b.is_ascii_alphanumeric())
}
