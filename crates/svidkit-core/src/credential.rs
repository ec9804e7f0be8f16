//! Identity credential: certificate chain, private key, trust bundle and
//! validity window.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

use crate::error::CoreError;

/// The material proving an identity, with a bounded validity window.
///
/// A `Credential` can only be built through [`Credential::new`], which
/// enforces `expires_at > issued_at`. The private key is wiped from memory
/// when the last copy is dropped and never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    cert_chain_pem: String,
    private_key_pem: Zeroizing<String>,
    bundle_pem: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Credential {
    /// Create a new credential.
    pub fn new(
        cert_chain_pem: impl Into<String>,
        private_key_pem: impl Into<String>,
        bundle_pem: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        if expires_at <= issued_at {
            return Err(CoreError::InvalidValidity {
                issued_at: issued_at.to_rfc3339(),
                expires_at: expires_at.to_rfc3339(),
            });
        }

        let cert_chain_pem = cert_chain_pem.into();
        let private_key_pem = Zeroizing::new(private_key_pem.into());
        let bundle_pem = bundle_pem.into();

        if cert_chain_pem.trim().is_empty() {
            return Err(CoreError::EmptyCredentialField("cert_chain"));
        }
        if private_key_pem.trim().is_empty() {
            return Err(CoreError::EmptyCredentialField("private_key"));
        }
        if bundle_pem.trim().is_empty() {
            return Err(CoreError::EmptyCredentialField("bundle"));
        }

        Ok(Self {
            cert_chain_pem,
            private_key_pem,
            bundle_pem,
            issued_at,
            expires_at,
        })
    }

    /// Certificate chain (PEM), leaf first.
    pub fn cert_chain_pem(&self) -> &str {
        &self.cert_chain_pem
    }

    /// Private key (PEM).
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// Trust bundle (PEM).
    pub fn bundle_pem(&self) -> &str {
        &self.bundle_pem
    }

    /// When the credential was issued.
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// When the credential expires.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Time remaining until expiry, saturating at zero.
    pub fn time_to_expiry(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the credential has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Total lifetime of the credential.
    pub fn lifetime(&self) -> Duration {
        (self.expires_at - self.issued_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("cert_chain_pem_len", &self.cert_chain_pem.len())
            .field("private_key_pem", &"<redacted>")
            .field("bundle_pem_len", &self.bundle_pem.len())
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
