//! Client library for the identity issuance service.
//!
//! Registers workloads, resolves workload handles, requests credentials and
//! submits peer certificates for verification. Calls are never retried here;
//! retry policy belongs to the caller.

pub mod api;
pub mod error;
pub mod http;
pub mod types;

pub use api::IssuanceApi;
pub use error::IssuanceError;
pub use http::IssuanceClient;
