//! Peer certificate validation results.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::SpiffeId;

/// Outcome of a remote certificate verification.
///
/// Produced fresh per verification call and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,

    #[serde(default)]
    pub spiffe_id: String,

    #[serde(default)]
    pub subject: String,

    #[serde(default)]
    pub issuer: String,

    #[serde(default)]
    pub not_before: String,

    #[serde(default)]
    pub not_after: String,
}

impl ValidationResult {
    /// Parse the verified identity.
    pub fn identity(&self) -> Result<SpiffeId, CoreError> {
        SpiffeId::parse(&self.spiffe_id)
    }
}

/// Verified caller identity, attached to an inbound request after its peer
/// certificate passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPeer {
    pub identity: SpiffeId,
    pub subject: String,
    pub issuer: String,
    pub not_after: String,
}

impl TryFrom<ValidationResult> for VerifiedPeer {
    type Error = CoreError;

    fn try_from(result: ValidationResult) -> Result<Self, Self::Error> {
        let identity = result.identity()?;
        Ok(Self {
            identity,
            subject: result.subject,
            issuer: result.issuer,
            not_after: result.not_after,
        })
    }
}
