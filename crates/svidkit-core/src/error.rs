//! Core domain errors.

use thiserror::Error;

/// Core domain errors for svidkit.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// The string is not a valid SPIFFE ID.
    #[error("Invalid SPIFFE ID '{id}': {reason}")]
    InvalidSpiffeId { id: String, reason: String },

    /// The trust domain name is not valid.
    #[error("Invalid trust domain '{0}'")]
    InvalidTrustDomain(String),

    /// A credential whose validity window is empty or inverted.
    #[error("Invalid credential validity: expires_at {expires_at} is not after issued_at {issued_at}")]
    InvalidValidity {
        issued_at: String,
        expires_at: String,
    },

    /// A required credential field was empty.
    #[error("Credential field '{0}' is empty")]
    EmptyCredentialField(&'static str),

    /// Invalid domain rule.
    #[error("Invalid domain rule '{0}'")]
    InvalidDomainRule(String),
}

/// Malformed service profile. Never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("missing required field: {0}")]
    Missing(&'static str),

    /// A field value failed validation.
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// The identity belongs to a different trust domain than the profile.
    #[error("identity {identity} is not in trust domain {trust_domain}")]
    TrustDomainMismatch {
        identity: String,
        trust_domain: String,
    },

    /// The profile file could not be read.
    #[error("failed to read profile from '{path}': {reason}")]
    Read { path: String, reason: String },

    /// The profile document is not valid JSON for a profile.
    #[error("failed to parse profile: {0}")]
    Parse(String),

    /// Domain model error while building the profile.
    #[error(transparent)]
    Core(#[from] CoreError),
}
