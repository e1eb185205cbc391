//! HTTP gateway client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::GatewayError;

/// Default bound on a whole delivery request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One message handed to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    #[serde(rename = "id")]
    pub message_id: u64,
    #[serde(rename = "phone")]
    pub phone_number: String,
    pub text: String,
}

/// Something that can deliver a message to a recipient.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Deliver one message. `Ok` means the gateway accepted it.
    async fn send(&self, request: &DeliveryRequest) -> Result<(), GatewayError>;
}

/// Gateway reached over HTTP with a bearer token.
///
/// Each message is POSTed as JSON to `{base_url}/{message_id}`.
pub struct HttpGateway {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpGateway {
    /// Create a client with the default timeouts.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, GatewayError> {
        Self::with_timeout(base_url, token, DEFAULT_TIMEOUT)
    }

    /// Create a client whose requests are bounded by `timeout`.
    pub fn with_timeout(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()
            .map_err(GatewayError::Build)?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, message_id: u64) -> String {
        format!("{}/{}", self.base_url, message_id)
    }
}

#[async_trait]
impl MessageGateway for HttpGateway {
    async fn send(&self, request: &DeliveryRequest) -> Result<(), GatewayError> {
        let url = self.url_for(request.message_id);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(message_id = request.message_id, %status, "gateway accepted message");
        Ok(())
    }
}
