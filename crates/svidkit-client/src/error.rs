//! Error types for the issuance client.

use thiserror::Error;

/// Errors that can occur when talking to the issuance service.
#[derive(Debug, Error)]
pub enum IssuanceError {
    /// The service could not be reached, or the call timed out.
    #[error("network error calling {operation}: {source}")]
    Network {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The service answered with a status other than the documented success.
    #[error("{operation} failed with status {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// The response body could not be decoded.
    #[error("failed to decode {operation} response: {reason}")]
    Decode {
        operation: &'static str,
        reason: String,
    },

    /// Lookup returned no matching workload.
    #[error("workload not found for SPIFFE ID: {0}")]
    NotFound(String),

    /// The client could not be constructed.
    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl IssuanceError {
    /// Whether the failure is a protocol error (bad status or body).
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Status { .. } | Self::Decode { .. })
    }

    /// Whether the failure happened before any response arrived.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}
