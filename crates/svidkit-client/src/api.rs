//! The issuance operations as a trait, so callers can be exercised against
//! an in-memory service.

use async_trait::async_trait;

use svidkit_core::{Credential, SpiffeId, ValidationResult, WorkloadHandle};

use crate::error::IssuanceError;

/// Operations offered by the identity issuance service.
#[async_trait]
pub trait IssuanceApi: Send + Sync {
    /// Register the workload. Not idempotent: a repeat registration may be
    /// rejected by the service.
    async fn register(
        &self,
        identity: &SpiffeId,
        workload_type: &str,
        selectors: &[String],
    ) -> Result<(), IssuanceError>;

    /// Resolve an identity to its issuance-side handle.
    async fn lookup_workload_handle(
        &self,
        identity: &SpiffeId,
    ) -> Result<WorkloadHandle, IssuanceError>;

    /// Request a new credential for a registered workload.
    async fn fetch_credential(&self, handle: &WorkloadHandle)
        -> Result<Credential, IssuanceError>;

    /// Submit a PEM certificate for validation against the trust bundle.
    async fn verify_certificate(
        &self,
        certificate_pem: &str,
    ) -> Result<ValidationResult, IssuanceError>;
}
