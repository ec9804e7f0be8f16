//! The workload identity facade.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use svidkit_client::{IssuanceApi, IssuanceClient, IssuanceError};
use svidkit_core::{
    ConfigError, Credential, DomainRule, ServiceProfile, ValidationResult, WorkloadHandle,
};

use crate::clock::{Clock, SystemClock};
use crate::crypto;
use crate::error::{Error, Result};
use crate::inbound::{IdentityServer, ValidationLayer};
use crate::outbound::OutgoingAttachment;
use crate::renewal::{Refresher, RenewalScheduler};
use crate::router::{MutualTransport, TransportRouter};
use crate::store::CredentialStore;
use crate::tls;

/// A running workload identity.
///
/// Holds the credential, keeps it renewed in the background, and hands out
/// transports and middleware that use it.
pub struct WorkloadIdentity {
    profile: ServiceProfile,
    issuance: Arc<dyn IssuanceApi>,
    clock: Arc<dyn Clock>,
    store: Arc<CredentialStore>,
    transport_store: Arc<CredentialStore>,
    refresher: Arc<Refresher>,
    scheduler: Arc<RenewalScheduler>,
    mutual: Arc<MutualTransport>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkloadIdentity {
    /// Register with the issuance service named in `profile`, obtain the
    /// first credential and start renewing it.
    pub async fn initialize(profile: ServiceProfile) -> Result<Self> {
        let client_error = |source| Error::Startup {
            stage: "client",
            source,
        };
        let mut client = IssuanceClient::new(
            profile.issuance_endpoint().clone(),
            profile.issuance_timeout(),
        )
        .map_err(client_error)?;
        if let Some(verify) = profile.verify_endpoint() {
            client = client
                .with_verify_endpoint(verify.clone())
                .map_err(client_error)?;
        }

        Self::initialize_with(profile, Arc::new(client), Arc::new(SystemClock)).await
    }

    /// Like [`initialize`](Self::initialize) with an explicit issuance
    /// service and clock.
    ///
    /// Registration, lookup and the first fetch run in order; the first
    /// failure aborts and nothing is left running.
    pub async fn initialize_with(
        profile: ServiceProfile,
        issuance: Arc<dyn IssuanceApi>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let identity = profile.identity();
        info!(
            identity = %identity,
            endpoint = %profile.issuance_endpoint(),
            selectors = profile.selectors().len(),
            "Initializing workload identity"
        );

        issuance
            .register(identity, profile.workload_type(), profile.selectors())
            .await
            .map_err(startup("register"))?;

        let handle = issuance
            .lookup_workload_handle(identity)
            .await
            .map_err(startup("lookup"))?;

        let credential = issuance
            .fetch_credential(&handle)
            .await
            .map_err(startup("fetch_credential"))?;

        info!(
            identity = %identity,
            handle = %handle,
            expires_at = %credential.expires_at(),
            fingerprint = %crypto::leaf_fingerprint(&credential)
                .unwrap_or_else(|| "unknown".to_string()),
            "Initial credential issued"
        );

        let store = Arc::new(CredentialStore::new(credential));
        let refresher = Arc::new(Refresher::new(
            issuance.clone(),
            identity.clone(),
            handle,
            store.clone(),
        ));
        let scheduler = Arc::new(RenewalScheduler::new(
            store.clone(),
            refresher.clone(),
            clock.clone(),
            profile.renewal_threshold(),
            profile.check_interval(),
            profile.backoff(),
        ));

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let transport_store = match transport_store(&profile, &store, &cancel, &mut tasks).await {
            Ok(transport_store) => transport_store,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        };

        tasks.push(scheduler.clone().spawn(cancel.child_token()));

        let mutual = Arc::new(MutualTransport::new(
            transport_store.clone(),
            profile.trust_domain().clone(),
            profile.outbound_timeout(),
        ));

        Ok(Self {
            profile,
            issuance,
            clock,
            store,
            transport_store,
            refresher,
            scheduler,
            mutual,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    // ========================================================================
    // Credential
    // ========================================================================

    /// Current credential.
    pub fn credential(&self) -> Arc<Credential> {
        self.store.get()
    }

    /// Whether the current credential is past its expiry. Mutual TLS
    /// handshakes fail in this state until a renewal succeeds.
    pub fn credential_expired(&self) -> bool {
        self.store.get().is_expired(self.clock.now())
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn profile(&self) -> &ServiceProfile {
        &self.profile
    }

    /// The issuance service this identity talks to.
    pub fn issuance(&self) -> Arc<dyn IssuanceApi> {
        self.issuance.clone()
    }

    /// Issuance-side handle used by the latest refresh.
    pub fn workload_handle(&self) -> WorkloadHandle {
        self.refresher.handle()
    }

    pub fn scheduler(&self) -> &Arc<RenewalScheduler> {
        &self.scheduler
    }

    /// Fetch a new credential now. Concurrent callers share one fetch.
    pub async fn refresh_now(&self) -> Result<Arc<Credential>> {
        let snapshot = self.refresher.refresh().await?;
        info!(generation = snapshot.generation, "Credential refreshed on demand");
        Ok(snapshot.credential)
    }

    /// Submit a PEM certificate to the issuance service.
    pub async fn validate_certificate(&self, certificate_pem: &str) -> Result<ValidationResult> {
        Ok(self.issuance.verify_certificate(certificate_pem).await?)
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// HTTP client presenting the current credential.
    pub fn mtls_client(&self) -> Result<reqwest::Client> {
        self.mutual.client()
    }

    /// Router using mutual TLS for hosts matching `rules`.
    pub fn transport_router<I, S>(&self, rules: I) -> Result<TransportRouter>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = rules
            .into_iter()
            .map(|rule| DomainRule::parse(rule.as_ref()).map_err(ConfigError::from))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        TransportRouter::new(rules, self.mutual.clone(), self.profile.outbound_timeout())
    }

    /// Router using the profile's internal domain rules.
    pub fn internal_client(&self) -> Result<TransportRouter> {
        TransportRouter::new(
            self.profile.internal_domains().to_vec(),
            self.mutual.clone(),
            self.profile.outbound_timeout(),
        )
    }

    /// Sends copies of caller-built requests over mutual TLS.
    pub fn outgoing(&self) -> OutgoingAttachment {
        OutgoingAttachment::new(self.mutual.clone())
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    pub fn validation_layer(&self) -> ValidationLayer {
        ValidationLayer::from_profile(self.issuance.clone(), &self.profile)
    }

    /// Require authenticated callers on every route of `router`.
    pub fn protect(&self, router: Router) -> Router {
        self.validation_layer().apply(router)
    }

    /// TLS server configuration presenting the current credential.
    pub fn server_config(&self) -> Result<rustls::ServerConfig> {
        Ok(tls::server_config(&self.transport_store.get())?)
    }

    /// Mutual TLS server following renewals. Stops on [`shutdown`](Self::shutdown).
    pub fn server(&self) -> Result<IdentityServer> {
        IdentityServer::new(self.transport_store.clone(), self.cancel.child_token())
    }

    /// Serve `router` over mutual TLS on `addr`, protected by the validation
    /// layer, until shutdown.
    pub async fn serve(&self, addr: SocketAddr, router: Router) -> Result<()> {
        self.server()?.serve(addr, self.protect(router)).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop background tasks and servers. In-flight requests finish.
    pub async fn shutdown(&self) {
        info!(identity = %self.profile.identity(), "Shutting down workload identity");
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
    }
}

impl Drop for WorkloadIdentity {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn startup(stage: &'static str) -> impl FnOnce(IssuanceError) -> Error {
    move |source| Error::Startup { stage, source }
}

#[cfg(feature = "workload-agent")]
async fn transport_store(
    profile: &ServiceProfile,
    store: &Arc<CredentialStore>,
    cancel: &CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<Arc<CredentialStore>> {
    let Some(socket) = profile.agent_socket() else {
        return Ok(store.clone());
    };

    let mut source = crate::agent::AgentSource::connect(socket, profile.trust_domain()).await?;
    let agent_store = Arc::new(CredentialStore::new(source.fetch().await?));
    tasks.push(crate::agent::spawn_refresh(
        source,
        agent_store.clone(),
        profile.check_interval(),
        cancel.child_token(),
    ));
    Ok(agent_store)
}

#[cfg(not(feature = "workload-agent"))]
async fn transport_store(
    profile: &ServiceProfile,
    store: &Arc<CredentialStore>,
    _cancel: &CancellationToken,
    _tasks: &mut Vec<JoinHandle<()>>,
) -> Result<Arc<CredentialStore>> {
    if let Some(socket) = profile.agent_socket() {
        warn!(
            socket = %socket.display(),
            "Workload agent socket configured but agent support is not compiled in, ignoring"
        );
    }
    Ok(store.clone())
}
