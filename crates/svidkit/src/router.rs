//! Per-destination choice between mutual TLS and plain transport.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::{Client, Method, Request, RequestBuilder, Response, Url};
use tracing::debug;

use svidkit_core::{classify, Credential, DomainRule, Route, TrustDomain};

use crate::error::{Error, Result};
use crate::store::CredentialStore;
use crate::tls::{self, TlsError};

/// HTTP client presenting the current credential.
///
/// The underlying client is rebuilt the first time it is needed after the
/// store's generation changes, so connections opened after a renewal use the
/// new material.
pub struct MutualTransport {
    store: Arc<CredentialStore>,
    trust_domain: TrustDomain,
    timeout: Duration,
    cached: Mutex<Option<(u64, Client)>>,
}

impl MutualTransport {
    pub fn new(store: Arc<CredentialStore>, trust_domain: TrustDomain, timeout: Duration) -> Self {
        Self {
            store,
            trust_domain,
            timeout,
            cached: Mutex::new(None),
        }
    }

    /// Client built from the current credential.
    pub fn client(&self) -> Result<Client> {
        let snapshot = self.store.snapshot();

        {
            let cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((generation, client)) = cached.as_ref() {
                if *generation == snapshot.generation {
                    return Ok(client.clone());
                }
            }
        }

        let client = build_mutual_client(&snapshot.credential, &self.trust_domain, self.timeout)?;
        debug!(generation = snapshot.generation, "Built mutual TLS client");

        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let newer = cached
            .as_ref()
            .map_or(true, |(generation, _)| *generation < snapshot.generation);
        if newer {
            *cached = Some((snapshot.generation, client.clone()));
        }
        Ok(client)
    }

    /// Send a request over mutual TLS.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let client = self.client()?;
        Ok(client.execute(request).await?)
    }

    /// Generation the cached client was built from.
    pub fn cached_generation(&self) -> Option<u64> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(generation, _)| *generation)
    }
}

fn build_mutual_client(
    credential: &Credential,
    trust_domain: &TrustDomain,
    timeout: Duration,
) -> Result<Client> {
    let config = tls::client_config(credential, trust_domain)?;
    Client::builder()
        .use_preconfigured_tls(config)
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Tls(TlsError::Client(e.to_string())))
}

/// Routes requests to mutual TLS or plain transport by destination host.
///
/// Rules are checked in order; the first match wins. Hosts matching no rule
/// go over plain transport.
pub struct TransportRouter {
    rules: Vec<DomainRule>,
    mutual: Arc<MutualTransport>,
    plain: Client,
}

impl TransportRouter {
    pub fn new(rules: Vec<DomainRule>, mutual: Arc<MutualTransport>, timeout: Duration) -> Result<Self> {
        let plain = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Tls(TlsError::Client(e.to_string())))?;

        Ok(Self {
            rules,
            mutual,
            plain,
        })
    }

    pub fn rules(&self) -> &[DomainRule] {
        &self.rules
    }

    /// Route for a host name.
    pub fn route(&self, host: &str) -> Route {
        classify(&self.rules, host)
    }

    /// Client for the route of `url`. URLs without a host go plain.
    pub fn client_for(&self, url: &Url) -> Result<Client> {
        let host = url.host_str().unwrap_or_default();
        match self.route(host) {
            Route::Mutual => self.mutual.client(),
            Route::Plain => Ok(self.plain.clone()),
        }
    }

    /// Start a request on the transport chosen for `url`.
    pub fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let url = Url::parse(url).map_err(|e| Error::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let client = self.client_for(&url)?;
        Ok(client.request(method, url))
    }

    /// Send a request on the transport chosen for its URL.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let host = request.url().host_str().unwrap_or_default().to_string();
        let route = self.route(&host);
        debug!(host = %host, route = ?route, "Dispatching request");

        let client = match route {
            Route::Mutual => self.mutual.client()?,
            Route::Plain => self.plain.clone(),
        };
        Ok(client.execute(request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::testing::TestCa;

    fn rules(raw: &[&str]) -> Vec<DomainRule> {
        raw.iter().map(|r| DomainRule::parse(r).unwrap()).collect()
    }

    fn store(ca: &TestCa) -> Arc<CredentialStore> {
        Arc::new(CredentialStore::new(
            ca.credential("spiffe://authsec.dev/svc-a", Utc::now()),
        ))
    }

    fn router(store: Arc<CredentialStore>) -> (TransportRouter, Arc<MutualTransport>) {
        let mutual = Arc::new(MutualTransport::new(
            store,
            TrustDomain::new("authsec.dev").unwrap(),
            Duration::from_secs(5),
        ));
        let router = TransportRouter::new(
            rules(&[".svc.cluster.local", "authsec"]),
            mutual.clone(),
            Duration::from_secs(5),
        )
        .unwrap();
        (router, mutual)
    }

    #[test]
    fn test_routing_table() {
        let ca = TestCa::new();
        let (router, _) = router(store(&ca));

        assert_eq!(router.route("api.svc.cluster.local"), Route::Mutual);
        assert_eq!(router.route("authsec"), Route::Mutual);
        assert_eq!(router.route("db.authsec"), Route::Mutual);
        assert_eq!(router.route("notauthsec"), Route::Plain);
        assert_eq!(router.route("google.com"), Route::Plain);
    }

    #[test]
    fn test_plain_route_does_not_build_mutual_client() {
        let ca = TestCa::new();
        let (router, mutual) = router(store(&ca));

        router
            .client_for(&Url::parse("https://google.com/").unwrap())
            .unwrap();
        assert_eq!(mutual.cached_generation(), None);
    }

    #[test]
    fn test_mutual_client_rebuilt_after_renewal() {
        let ca = TestCa::new();
        let store = store(&ca);
        let (router, mutual) = router(store.clone());

        let url = Url::parse("https://payments.svc.cluster.local/charge").unwrap();
        router.client_for(&url).unwrap();
        assert_eq!(mutual.cached_generation(), Some(1));

        router.client_for(&url).unwrap();
        assert_eq!(mutual.cached_generation(), Some(1));

        store.set(ca.credential("spiffe://authsec.dev/svc-a", Utc::now()));
        router.client_for(&url).unwrap();
        assert_eq!(mutual.cached_generation(), Some(2));
    }

    #[test]
    fn test_bad_material_fails_at_dial_time() {
        let now = Utc::now();
        let broken = Credential::new(
            "not a cert",
            "not a key",
            "not a bundle",
            now,
            now + chrono::TimeDelta::hours(1),
        )
        .unwrap();
        let (router, _) = router(Arc::new(CredentialStore::new(broken)));

        let err = router
            .request(Method::GET, "https://api.svc.cluster.local/")
            .unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }
}
