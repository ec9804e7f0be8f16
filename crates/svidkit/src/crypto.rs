//! Certificate parsing helpers.
//!
//! Extracts the SPIFFE ID from an X.509 certificate's URI SAN, converts
//! between DER and PEM, and computes fingerprints for logging.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use svidkit_core::{Credential, SpiffeId};

/// Errors that can occur while inspecting a certificate.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("invalid PEM: {0}")]
    Pem(String),

    #[error("no certificate found in PEM input")]
    Missing,

    #[error("certificate has no SPIFFE ID in its URI SAN")]
    MissingSpiffeId,

    #[error("certificate URI SAN is not a valid SPIFFE ID: {0}")]
    InvalidSpiffeId(String),

    #[error("certificate validity is out of range")]
    InvalidValidity,
}

/// Extract the SPIFFE ID from a DER-encoded certificate.
///
/// The first `spiffe://` URI in the subject alternative names is used.
pub fn spiffe_id_from_der(cert_der: &[u8]) -> Result<SpiffeId, CertificateError> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| CertificateError::Parse(format!("{:?}", e)))?;

    let san = cert
        .subject_alternative_name()
        .map_err(|e| CertificateError::Parse(format!("{:?}", e)))?
        .ok_or(CertificateError::MissingSpiffeId)?;

    let uri = san
        .value
        .general_names
        .iter()
        .find_map(|name| match name {
            GeneralName::URI(uri) if uri.starts_with("spiffe://") => Some(*uri),
            _ => None,
        })
        .ok_or(CertificateError::MissingSpiffeId)?;

    SpiffeId::parse(uri).map_err(|e| CertificateError::InvalidSpiffeId(e.to_string()))
}

/// Validity window (`not_before`, `not_after`) of a DER-encoded certificate.
pub fn validity_from_der(
    cert_der: &[u8],
) -> Result<(DateTime<Utc>, DateTime<Utc>), CertificateError> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| CertificateError::Parse(format!("{:?}", e)))?;

    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or(CertificateError::InvalidValidity)?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or(CertificateError::InvalidValidity)?;

    Ok((not_before, not_after))
}

/// Encode a DER certificate as PEM.
pub fn certificate_to_pem(cert_der: &[u8]) -> String {
    pem::encode(&pem::Pem::new("CERTIFICATE", cert_der.to_vec()))
}

/// DER bytes of the first certificate in a PEM document.
pub fn first_certificate_der(pem_input: &str) -> Result<Vec<u8>, CertificateError> {
    pem::parse_many(pem_input)
        .map_err(|e| CertificateError::Pem(e.to_string()))?
        .into_iter()
        .find(|p| p.tag() == "CERTIFICATE")
        .map(|p| p.into_contents())
        .ok_or(CertificateError::Missing)
}

/// SHA-256 fingerprint, lowercase hex.
pub fn fingerprint(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

/// Fingerprint of the credential's leaf certificate, if it parses.
pub fn leaf_fingerprint(credential: &Credential) -> Option<String> {
    first_certificate_der(credential.cert_chain_pem())
        .ok()
        .map(|der| fingerprint(&der))
}
