//! svidkit
//!
//! Gives a networked service a rotating workload identity and uses it to
//! authenticate traffic in both directions:
//!
//! - [`store`] holds the current credential and hands out snapshots.
//! - [`renewal`] refreshes the credential before it expires.
//! - [`router`] and [`outbound`] pick mutual TLS or plain transport per
//!   destination host.
//! - [`inbound`] validates peer certificates and exposes the verified
//!   identity to handlers.
//!
//! [`WorkloadIdentity`] wires all of it together.

pub mod backoff;
pub mod clock;
pub mod crypto;
pub mod error;
pub mod inbound;
pub mod outbound;
pub mod renewal;
pub mod router;
pub mod sdk;
pub mod store;
pub mod tls;

#[cfg(feature = "workload-agent")]
pub mod agent;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, RenewalError, Result};
pub use inbound::{AuthenticationError, PeerCertificates, ValidationLayer};
pub use outbound::OutgoingAttachment;
pub use renewal::{RenewalScheduler, RenewalState, Refresher, TickOutcome};
pub use router::{MutualTransport, TransportRouter};
pub use sdk::WorkloadIdentity;
pub use store::{CredentialStore, Snapshot};

pub use svidkit_client::{IssuanceApi, IssuanceClient, IssuanceError};
pub use svidkit_core::{
    classify, AbsentCertificatePolicy, BackoffPolicy, ConfigError, Credential, DomainRule,
    ProfileFile, Route, ServiceProfile, SpiffeId, TrustDomain, ValidationResult, VerifiedPeer,
    WorkloadHandle,
};
