//! Wire types of the issuance protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Registration
// ============================================================================

/// Request body for `POST /workloads/register-and-issue`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub spiffe_id: String,

    /// Workload type, e.g. "application".
    #[serde(rename = "type")]
    pub workload_type: String,

    /// Attestation selectors.
    pub selectors: Vec<String>,
}

// ============================================================================
// Lookup
// ============================================================================

/// Response body for `GET /workloads?spiffe_id=...`.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkloadList {
    #[serde(default)]
    pub workloads: Vec<WorkloadEntry>,
}

/// One registered workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadEntry {
    pub id: String,

    #[serde(default)]
    pub spiffe_id: String,
}

// ============================================================================
// Credential issuance
// ============================================================================

/// Response body for `POST /workloads/{id}/svid`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SvidResponse {
    /// Certificate chain (PEM encoded).
    pub x509_svid: String,

    /// Private key (PEM encoded).
    pub private_key: String,

    /// Trust bundle (PEM encoded).
    pub bundle: String,

    pub issued_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Verification
// ============================================================================

/// Request body for `POST /verify/certificate`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyRequest {
    /// Certificate (PEM encoded).
    pub certificate: String,
}
