//! Service profile: the immutable configuration of one workload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;
use crate::ids::{SpiffeId, TrustDomain};
use crate::rule::DomainRule;

/// Default workload type sent on registration.
pub const DEFAULT_WORKLOAD_TYPE: &str = "application";

/// What the inbound layer does with a request that presented no certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsentCertificatePolicy {
    /// Reject unless the path is explicitly public.
    #[default]
    Reject,
    /// Forward to the handler without an attached identity.
    PassThrough,
}

/// Bounded exponential backoff applied after failed renewals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure. `None` uses the check interval.
    pub initial_delay: Option<Duration>,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: None,
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

/// Configuration of one workload. Immutable after construction.
#[derive(Debug, Clone)]
pub struct ServiceProfile {
    identity: SpiffeId,
    trust_domain: TrustDomain,
    workload_type: String,
    selectors: Vec<String>,
    issuance_endpoint: Url,
    verify_endpoint: Option<Url>,
    renewal_threshold: Duration,
    check_interval: Duration,
    issuance_timeout: Duration,
    outbound_timeout: Duration,
    internal_domains: Vec<DomainRule>,
    agent_socket: Option<PathBuf>,
    backoff: BackoffPolicy,
    absent_certificate: AbsentCertificatePolicy,
    public_paths: Vec<String>,
}

impl ServiceProfile {
    /// Start building a profile for `identity`.
    pub fn builder(identity: impl Into<String>) -> ServiceProfileBuilder {
        ServiceProfileBuilder::new(identity)
    }

    pub fn identity(&self) -> &SpiffeId {
        &self.identity
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    pub fn workload_type(&self) -> &str {
        &self.workload_type
    }

    pub fn selectors(&self) -> &[String] {
        &self.selectors
    }

    pub fn issuance_endpoint(&self) -> &Url {
        &self.issuance_endpoint
    }

    /// Base URL for certificate verification when it is served apart from
    /// the workload API. `None` means the issuance endpoint serves it.
    pub fn verify_endpoint(&self) -> Option<&Url> {
        self.verify_endpoint.as_ref()
    }

    /// Renew once the time to expiry drops to this value.
    pub fn renewal_threshold(&self) -> Duration {
        self.renewal_threshold
    }

    /// How often the renewal loop checks the credential.
    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Bound on every issuance-service call.
    pub fn issuance_timeout(&self) -> Duration {
        self.issuance_timeout
    }

    /// Bound on outbound calls made through credential-backed transports.
    pub fn outbound_timeout(&self) -> Duration {
        self.outbound_timeout
    }

    pub fn internal_domains(&self) -> &[DomainRule] {
        &self.internal_domains
    }

    /// Local workload agent socket, if transports should use it.
    pub fn agent_socket(&self) -> Option<&Path> {
        self.agent_socket.as_deref()
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub fn absent_certificate(&self) -> AbsentCertificatePolicy {
        self.absent_certificate
    }

    /// Paths served without a client certificate.
    pub fn public_paths(&self) -> &[String] {
        &self.public_paths
    }
}

/// Builder for [`ServiceProfile`].
#[derive(Debug, Clone)]
pub struct ServiceProfileBuilder {
    identity: String,
    trust_domain: Option<String>,
    workload_type: String,
    selectors: Vec<String>,
    issuance_endpoint: Option<String>,
    verify_endpoint: Option<String>,
    renewal_threshold: Duration,
    check_interval: Duration,
    issuance_timeout: Duration,
    outbound_timeout: Duration,
    internal_domains: Vec<String>,
    agent_socket: Option<PathBuf>,
    backoff: BackoffPolicy,
    absent_certificate: AbsentCertificatePolicy,
    public_paths: Vec<String>,
}

impl ServiceProfileBuilder {
    fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            trust_domain: None,
            workload_type: DEFAULT_WORKLOAD_TYPE.to_string(),
            selectors: Vec::new(),
            issuance_endpoint: None,
            verify_endpoint: None,
            renewal_threshold: Duration::from_secs(5 * 60),
            check_interval: Duration::from_secs(60),
            issuance_timeout: Duration::from_secs(10),
            outbound_timeout: Duration::from_secs(30),
            internal_domains: Vec::new(),
            agent_socket: None,
            backoff: BackoffPolicy::default(),
            absent_certificate: AbsentCertificatePolicy::default(),
            public_paths: Vec::new(),
        }
    }

    /// Trust domain; defaults to the identity's.
    pub fn trust_domain(mut self, trust_domain: impl Into<String>) -> Self {
        self.trust_domain = Some(trust_domain.into());
        self
    }

    pub fn workload_type(mut self, workload_type: impl Into<String>) -> Self {
        self.workload_type = workload_type.into();
        self
    }

    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selectors.push(selector.into());
        self
    }

    pub fn selectors<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selectors.extend(selectors.into_iter().map(Into::into));
        self
    }

    pub fn issuance_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.issuance_endpoint = Some(endpoint.into());
        self
    }

    pub fn verify_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.verify_endpoint = Some(endpoint.into());
        self
    }

    pub fn renewal_threshold(mut self, threshold: Duration) -> Self {
        self.renewal_threshold = threshold;
        self
    }

    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn issuance_timeout(mut self, timeout: Duration) -> Self {
        self.issuance_timeout = timeout;
        self
    }

    pub fn outbound_timeout(mut self, timeout: Duration) -> Self {
        self.outbound_timeout = timeout;
        self
    }

    pub fn internal_domain(mut self, rule: impl Into<String>) -> Self {
        self.internal_domains.push(rule.into());
        self
    }

    pub fn agent_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.agent_socket = Some(path.into());
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn absent_certificate(mut self, policy: AbsentCertificatePolicy) -> Self {
        self.absent_certificate = policy;
        self
    }

    pub fn public_path(mut self, path: impl Into<String>) -> Self {
        self.public_paths.push(path.into());
        self
    }

    /// Validate and build the profile.
    pub fn build(self) -> Result<ServiceProfile, ConfigError> {
        let identity = SpiffeId::parse(&self.identity)?;

        let trust_domain = match self.trust_domain {
            Some(td) => TrustDomain::new(td)?,
            None => identity.trust_domain().clone(),
        };
        if !identity.is_member_of(&trust_domain) {
            return Err(ConfigError::TrustDomainMismatch {
                identity: identity.to_string(),
                trust_domain: trust_domain.to_string(),
            });
        }

        if self.workload_type.trim().is_empty() {
            return Err(ConfigError::Missing("workload_type"));
        }

        if self.selectors.is_empty() {
            return Err(ConfigError::Missing("selectors"));
        }
        if let Some(bad) = self.selectors.iter().find(|s| s.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                field: "selectors",
                reason: format!("empty selector {:?}", bad),
            });
        }

        let endpoint = self
            .issuance_endpoint
            .ok_or(ConfigError::Missing("issuance_endpoint"))?;
        let issuance_endpoint = parse_endpoint("issuance_endpoint", &endpoint)?;
        let verify_endpoint = self
            .verify_endpoint
            .map(|endpoint| parse_endpoint("verify_endpoint", &endpoint))
            .transpose()?;

        for (field, value) in [
            ("renewal_threshold", self.renewal_threshold),
            ("check_interval", self.check_interval),
            ("issuance_timeout", self.issuance_timeout),
            ("outbound_timeout", self.outbound_timeout),
            ("backoff.max_delay", self.backoff.max_delay),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if !(self.backoff.multiplier >= 1.0 && self.backoff.multiplier.is_finite()) {
            return Err(ConfigError::Invalid {
                field: "backoff.multiplier",
                reason: format!("must be a finite value >= 1.0, got {}", self.backoff.multiplier),
            });
        }

        let internal_domains = self
            .internal_domains
            .iter()
            .map(|r| DomainRule::parse(r))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(bad) = self.public_paths.iter().find(|p| !p.starts_with('/')) {
            return Err(ConfigError::Invalid {
                field: "public_paths",
                reason: format!("path {:?} must start with '/'", bad),
            });
        }

        Ok(ServiceProfile {
            identity,
            trust_domain,
            workload_type: self.workload_type,
            selectors: self.selectors,
            issuance_endpoint,
            verify_endpoint,
            renewal_threshold: self.renewal_threshold,
            check_interval: self.check_interval,
            issuance_timeout: self.issuance_timeout,
            outbound_timeout: self.outbound_timeout,
            internal_domains,
            agent_socket: self.agent_socket,
            backoff: self.backoff,
            absent_certificate: self.absent_certificate,
            public_paths: self.public_paths,
        })
    }
}

fn parse_endpoint(field: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::Invalid {
        field,
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(url)
}

fn default_renewal_threshold_secs() -> u64 {
    300
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_issuance_timeout_secs() -> u64 {
    10
}

fn default_outbound_timeout_secs() -> u64 {
    30
}

fn default_backoff_max_secs() -> u64 {
    300
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// On-disk JSON form of a [`ServiceProfile`]. Durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileFile {
    pub spiffe_id: String,

    #[serde(default)]
    pub trust_domain: Option<String>,

    #[serde(default, rename = "type")]
    pub workload_type: Option<String>,

    pub selectors: Vec<String>,

    pub issuance_endpoint: String,

    #[serde(default)]
    pub verify_endpoint: Option<String>,

    #[serde(default = "default_renewal_threshold_secs")]
    pub renewal_threshold_secs: u64,

    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    #[serde(default = "default_issuance_timeout_secs")]
    pub issuance_timeout_secs: u64,

    #[serde(default = "default_outbound_timeout_secs")]
    pub outbound_timeout_secs: u64,

    #[serde(default)]
    pub internal_domains: Vec<String>,

    #[serde(default)]
    pub agent_socket: Option<PathBuf>,

    #[serde(default)]
    pub backoff_initial_secs: Option<u64>,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default)]
    pub absent_certificate: AbsentCertificatePolicy,

    #[serde(default)]
    pub public_paths: Vec<String>,
}

impl ProfileFile {
    /// Parse a profile document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read and validate a profile from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<ServiceProfile, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&raw)?.into_profile()
    }

    /// Validate into a [`ServiceProfile`].
    pub fn into_profile(self) -> Result<ServiceProfile, ConfigError> {
        let mut builder = ServiceProfile::builder(self.spiffe_id)
            .selectors(self.selectors)
            .issuance_endpoint(self.issuance_endpoint)
            .renewal_threshold(Duration::from_secs(self.renewal_threshold_secs))
            .check_interval(Duration::from_secs(self.check_interval_secs))
            .issuance_timeout(Duration::from_secs(self.issuance_timeout_secs))
            .outbound_timeout(Duration::from_secs(self.outbound_timeout_secs))
            .backoff(BackoffPolicy {
                initial_delay: self.backoff_initial_secs.map(Duration::from_secs),
                max_delay: Duration::from_secs(self.backoff_max_secs),
                multiplier: self.backoff_multiplier,
            })
            .absent_certificate(self.absent_certificate);

        if let Some(td) = self.trust_domain {
            builder = builder.trust_domain(td);
        }
        if let Some(kind) = self.workload_type {
            builder = builder.workload_type(kind);
        }
        if let Some(endpoint) = self.verify_endpoint {
            builder = builder.verify_endpoint(endpoint);
        }
        if let Some(socket) = self.agent_socket {
            builder = builder.agent_socket(socket);
        }
        for rule in self.internal_domains {
            builder = builder.internal_domain(rule);
        }
        for path in self.public_paths {
            builder = builder.public_path(path);
        }

        builder.build()
    }
}
