//! Error types for the gateway client.

use thiserror::Error;

/// Errors that can occur when handing a message to the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    /// Request did not complete within the configured timeout.
    #[error("gateway request timed out")]
    Timeout,

    /// Connection or protocol failure.
    #[error("HTTP error: {0}")]
    Http(#[source] reqwest::Error),

    /// Gateway answered with a non-success status.
    #[error("gateway returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(e)
        }
    }
}
