//! Error types for svidkit.

use thiserror::Error;

use svidkit_client::IssuanceError;
use svidkit_core::ConfigError;

use crate::crypto::CertificateError;
use crate::tls::TlsError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the identity facade and its transports.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed profile.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An issuance call failed during initialization.
    #[error("startup failed during {stage}: {source}")]
    Startup {
        stage: &'static str,
        #[source]
        source: IssuanceError,
    },

    /// An issuance call failed after startup.
    #[error(transparent)]
    Issuance(#[from] IssuanceError),

    /// A credential refresh failed.
    #[error(transparent)]
    Renewal(#[from] RenewalError),

    /// Credential material could not be turned into a TLS configuration.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// A certificate could not be parsed.
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// An outbound request failed.
    #[error("outbound request failed: {0}")]
    Outbound(#[from] reqwest::Error),

    /// An outbound URL could not be parsed.
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The outbound request has a streaming body and cannot be dispatched
    /// on the caller's behalf.
    #[error("request body cannot be cloned")]
    NonCloneableRequest,

    /// The TLS server failed.
    #[error("server error: {0}")]
    Server(#[source] std::io::Error),

    /// The local workload agent failed.
    #[error("workload agent error: {0}")]
    Agent(String),
}

/// A credential refresh attempt failed. Never fatal; the scheduler retries.
#[derive(Debug, Error)]
pub enum RenewalError {
    /// The workload handle could not be resolved.
    #[error("workload lookup failed: {0}")]
    Lookup(#[source] IssuanceError),

    /// The issuance service did not return a new credential.
    #[error("credential fetch failed: {0}")]
    Fetch(#[from] IssuanceError),
}
