//! Destination classification for outbound traffic.
//!
//! A [`DomainRule`] list decides, per destination host, whether a request
//! should travel over mutually-authenticated transport or plain transport.
//! Evaluation is ordered and the first matching rule wins.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Transport selected for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Present our identity and verify the peer's.
    Mutual,
    /// Regular transport.
    Plain,
}

/// A destination-matching pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DomainRule {
    /// Dot-prefixed rule (`.svc.cluster.local`): matches the exact string or
    /// any host ending with it.
    Suffix(String),
    /// Bare rule (`authsec`): matches the exact host or any subdomain of it.
    Domain(String),
}

impl DomainRule {
    /// Parse a rule. A leading '.' makes it a suffix rule.
    pub fn parse(rule: &str) -> Result<Self, CoreError> {
        let normalized = rule.trim().trim_end_matches('.').to_ascii_lowercase();
        let body = normalized.trim_start_matches('.');
        if body.is_empty() || body.contains(['/', ':', ' ']) {
            return Err(CoreError::InvalidDomainRule(rule.to_string()));
        }

        if normalized.starts_with('.') {
            Ok(Self::Suffix(format!(".{}", body)))
        } else {
            Ok(Self::Domain(normalized))
        }
    }

    /// The rule text as configured.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Suffix(s) | Self::Domain(s) => s,
        }
    }

    /// Whether `host` (already normalized) matches this rule.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            Self::Suffix(suffix) => host == suffix || host.ends_with(suffix.as_str()),
            Self::Domain(domain) => {
                host == domain
                    || (host.len() > domain.len()
                        && host.ends_with(domain.as_str())
                        && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
            }
        }
    }
}

impl fmt::Display for DomainRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DomainRule {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DomainRule {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<DomainRule> for String {
    fn from(rule: DomainRule) -> Self {
        match rule {
            DomainRule::Suffix(s) | DomainRule::Domain(s) => s,
        }
    }
}

/// Normalize a destination host: lowercase, no port, no trailing dot.
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if host.starts_with('[') {
        // IPv6 literal; never matches a DNS rule but keep it intact
        host.split(']').next().map(|h| format!("{}]", h)).unwrap_or_default()
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
            _ => host.to_string(),
        }
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// Classify a destination host against an ordered rule list.
///
/// Deterministic and side-effect free.
pub fn classify(rules: &[DomainRule], host: &str) -> Route {
    let host = normalize_host(host);
    if host.is_empty() {
        return Route::Plain;
    }

    for rule in rules {
        if rule.matches(&host) {
            return Route::Mutual;
        }
    }

    Route::Plain
}
