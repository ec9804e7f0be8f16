//! Inbound authentication.
//!
//! The TLS acceptor records each connection's peer certificates, the
//! validation middleware checks them with the issuance service, and handlers
//! read the verified identity through the [`Caller`] extractor.

mod middleware;
mod peer;
mod server;

pub use middleware::{validate, Caller, ValidationLayer};
pub use peer::{PeerCertAcceptor, PeerCertificates};
pub use server::IdentityServer;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Why an inbound request was refused. Always rendered as 401.
#[derive(Debug, Error)]
pub enum AuthenticationError {
    /// The peer presented no certificate.
    #[error("client certificate required")]
    MissingCertificate,

    /// The issuance service judged the certificate invalid.
    #[error("client certificate rejected")]
    Rejected,

    /// The certificate could not be checked. Treated as a rejection.
    #[error("client certificate could not be verified")]
    VerificationUnavailable,

    /// The certificate was valid but carried no usable SPIFFE ID.
    #[error("client certificate has no valid SPIFFE ID")]
    InvalidIdentity,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for AuthenticationError {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
