//! Conversion of credential material into rustls configurations.
//!
//! Both directions trust only the credential's bundle. Outbound connections
//! accept a server whose leaf carries a SPIFFE ID from the local trust
//! domain, whatever DNS name it was dialed by.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
    ServerName, UnixTime,
};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig,
    SignatureScheme,
};
use thiserror::Error;
use tracing::{debug, warn};

use svidkit_core::{Credential, TrustDomain};

use crate::crypto;

/// Errors building TLS configuration from credential material.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("invalid PEM in {what}: {reason}")]
    Pem { what: &'static str, reason: String },

    #[error("no certificates found in {0}")]
    NoCertificates(&'static str),

    #[error("no supported private key found")]
    NoPrivateKey,

    #[error("trust bundle rejected: {0}")]
    Bundle(String),

    #[error("certificate verifier: {0}")]
    Verifier(String),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// The crypto provider used for every configuration.
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Decode every certificate in a PEM document.
pub fn certificates_from_pem(
    pem_input: &str,
    what: &'static str,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<CertificateDer<'static>> = pem::parse_many(pem_input)
        .map_err(|e| TlsError::Pem {
            what,
            reason: e.to_string(),
        })?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| CertificateDer::from(p.into_contents()))
        .collect();

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(what));
    }
    Ok(certs)
}

/// Decode the first private key in a PEM document.
pub fn private_key_from_pem(pem_input: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let blocks = pem::parse_many(pem_input).map_err(|e| TlsError::Pem {
        what: "private key",
        reason: e.to_string(),
    })?;

    blocks
        .into_iter()
        .find_map(|p| match p.tag() {
            "PRIVATE KEY" => Some(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                p.into_contents(),
            ))),
            "EC PRIVATE KEY" => Some(PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(
                p.into_contents(),
            ))),
            "RSA PRIVATE KEY" => Some(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(
                p.into_contents(),
            ))),
            _ => None,
        })
        .ok_or(TlsError::NoPrivateKey)
}

/// Root store holding every certificate of the trust bundle.
pub fn root_store(bundle_pem: &str) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in certificates_from_pem(bundle_pem, "trust bundle")? {
        roots
            .add(cert)
            .map_err(|e| TlsError::Bundle(e.to_string()))?;
    }
    Ok(roots)
}

/// Client configuration presenting the credential and trusting its bundle.
pub fn client_config(
    credential: &Credential,
    trust_domain: &TrustDomain,
) -> Result<ClientConfig, TlsError> {
    let provider = provider();
    let roots = Arc::new(root_store(credential.bundle_pem())?);
    let verifier = SpiffeServerVerifier::new(roots, trust_domain.clone(), provider.clone())?;

    let chain = certificates_from_pem(credential.cert_chain_pem(), "certificate chain")?;
    let key = private_key_from_pem(credential.private_key_pem())?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(chain, key)?;

    Ok(config)
}

/// Server configuration presenting the credential.
///
/// Client certificates are verified against the bundle when presented but
/// are not required at the TLS layer; the validation middleware decides what
/// to do with unauthenticated requests.
pub fn server_config(credential: &Credential) -> Result<ServerConfig, TlsError> {
    let provider = provider();
    let roots = Arc::new(root_store(credential.bundle_pem())?);

    let client_verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
        .allow_unauthenticated()
        .build()
        .map_err(|e| TlsError::Verifier(e.to_string()))?;

    let chain = certificates_from_pem(credential.cert_chain_pem(), "certificate chain")?;
    let key = private_key_from_pem(credential.private_key_pem())?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(config)
}

/// Server certificate verifier that identifies peers by SPIFFE ID.
///
/// The chain must validate against the bundle. A DNS name mismatch is
/// accepted; the leaf's SPIFFE ID must belong to the trust domain.
#[derive(Debug)]
pub struct SpiffeServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    trust_domain: TrustDomain,
}

impl SpiffeServerVerifier {
    pub fn new(
        roots: Arc<RootCertStore>,
        trust_domain: TrustDomain,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, TlsError> {
        let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|e| TlsError::Verifier(e.to_string()))?;
        Ok(Self {
            inner,
            trust_domain,
        })
    }
}

impl ServerCertVerifier for SpiffeServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(_) => {}
            // Chain validation already passed when the name check runs.
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName))
            | Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForNameContext { .. },
            )) => {
                debug!(server_name = ?server_name, "Ignoring DNS name mismatch for SPIFFE peer");
            }
            Err(e) => return Err(e),
        }

        let identity = crypto::spiffe_id_from_der(end_entity.as_ref()).map_err(|e| {
            warn!(error = %e, "Server certificate has no usable SPIFFE ID");
            rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
        })?;

        if !identity.is_member_of(&self.trust_domain) {
            warn!(
                identity = %identity,
                trust_domain = %self.trust_domain,
                "Server identity is outside the trust domain"
            );
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
