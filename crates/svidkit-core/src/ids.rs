//! Newtype wrappers for identifiers to ensure type safety.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CoreError;

const SPIFFE_SCHEME: &str = "spiffe";

/// Administrative namespace in which identities and bundles are meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrustDomain(String);

impl TrustDomain {
    /// Create a trust domain, validating its characters.
    ///
    /// Trust domain names are lowercase letters, digits, dots, dashes and
    /// underscores.
    pub fn new(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(CoreError::InvalidTrustDomain(name));
        }
        Ok(Self(name))
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for TrustDomain {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<TrustDomain> for String {
    fn from(td: TrustDomain) -> Self {
        td.0
    }
}

/// A workload identity: `spiffe://<trust-domain>/<path>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpiffeId {
    uri: String,
    trust_domain: TrustDomain,
}

impl SpiffeId {
    /// Parse a SPIFFE ID from its URI form.
    pub fn parse(uri: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::InvalidSpiffeId {
            id: uri.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;

        if url.scheme() != SPIFFE_SCHEME {
            return Err(invalid("scheme must be 'spiffe'"));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid("user info is not allowed"));
        }
        if url.port().is_some() {
            return Err(invalid("port is not allowed"));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("query and fragment are not allowed"));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing trust domain"))?;
        let trust_domain = TrustDomain::new(host).map_err(|_| invalid("invalid trust domain"))?;

        let path = url.path();
        if !path.is_empty() {
            if path.ends_with('/') {
                return Err(invalid("path must not end with '/'"));
            }
            if path
                .split('/')
                .skip(1)
                .any(|segment| segment.is_empty() || segment == "." || segment == "..")
            {
                return Err(invalid("path contains an empty or relative segment"));
            }
        }

        Ok(Self {
            uri: format!("{}://{}{}", SPIFFE_SCHEME, trust_domain, path),
            trust_domain,
        })
    }

    /// The trust domain this identity belongs to.
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// The path component, including the leading '/'.
    pub fn path(&self) -> &str {
        &self.uri[SPIFFE_SCHEME.len() + 3 + self.trust_domain.as_str().len()..]
    }

    /// Get the full URI.
    pub fn as_str(&self) -> &str {
        &self.uri
    }

    /// Whether this identity is a member of `trust_domain`.
    pub fn is_member_of(&self, trust_domain: &TrustDomain) -> bool {
        &self.trust_domain == trust_domain
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

impl FromStr for SpiffeId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SpiffeId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<SpiffeId> for String {
    fn from(id: SpiffeId) -> Self {
        id.uri
    }
}

/// Opaque issuance-side handle for a registered workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadHandle(String);

impl WorkloadHandle {
    /// Create a new WorkloadHandle from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for WorkloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WorkloadHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkloadHandle {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
