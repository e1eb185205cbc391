//! Outbound message gateway client for Herald.
//!
//! One authenticated HTTP POST per message. The only signal the scheduling
//! engine consumes is success or failure: transport errors, timeouts and
//! non-2xx statuses are all failures.

mod client;
mod error;

pub use client::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_TIMEOUT, DeliveryRequest, HttpGateway, MessageGateway,
};
pub use error::GatewayError;
