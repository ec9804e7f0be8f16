//! svidkit Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - TLS
//! - Runtime specifics
//!
//! All types here describe workload identity: who a workload is, the
//! credential proving it, and how the workload is configured.

pub mod credential;
pub mod error;
pub mod ids;
pub mod profile;
pub mod rule;
pub mod validation;

// Re-export commonly used types
pub use credential::Credential;
pub use error::{ConfigError, CoreError};
pub use ids::{SpiffeId, TrustDomain, WorkloadHandle};
pub use profile::{
    AbsentCertificatePolicy, BackoffPolicy, ProfileFile, ServiceProfile, ServiceProfileBuilder,
};
pub use rule::{classify, DomainRule, Route};
pub use validation::{ValidationResult, VerifiedPeer};
