//! Credentials from a local SPIFFE Workload API agent.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use spiffe::{TrustDomain as AgentTrustDomain, WorkloadApiClient};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use svidkit_core::{Credential, TrustDomain};

use crate::crypto;
use crate::error::{Error, Result};
use crate::store::CredentialStore;

/// Reads the X.509 SVID and bundle served by a local agent.
pub struct AgentSource {
    client: WorkloadApiClient,
    trust_domain: AgentTrustDomain,
}

impl AgentSource {
    /// Connect to the agent socket at `socket`.
    pub async fn connect(socket: &Path, trust_domain: &TrustDomain) -> Result<Self> {
        let raw = socket.display().to_string();
        let address = if raw.starts_with("unix:") {
            raw
        } else {
            format!("unix:{}", raw)
        };

        let client = WorkloadApiClient::new_from_path(&address)
            .await
            .map_err(|e| Error::Agent(format!("connect to {}: {}", address, e)))?;
        let trust_domain = AgentTrustDomain::try_from(trust_domain.as_str())
            .map_err(|e| Error::Agent(e.to_string()))?;

        info!(socket = %address, "Connected to workload agent");
        Ok(Self {
            client,
            trust_domain,
        })
    }

    /// Fetch the current SVID as a credential.
    pub async fn fetch(&mut self) -> Result<Credential> {
        let svid = self
            .client
            .fetch_x509_svid()
            .await
            .map_err(|e| Error::Agent(format!("fetch SVID: {}", e)))?;
        let bundles = self
            .client
            .fetch_x509_bundles()
            .await
            .map_err(|e| Error::Agent(format!("fetch bundles: {}", e)))?;

        let bundle = bundles.get_bundle(&self.trust_domain).ok_or_else(|| {
            Error::Agent(format!("no bundle for trust domain {}", self.trust_domain))
        })?;

        let chain: Vec<&[u8]> = svid.cert_chain().iter().map(|c| c.content()).collect();
        let authorities: Vec<&[u8]> = bundle.authorities().iter().map(|c| c.content()).collect();
        let credential = credential_from_der(&chain, svid.private_key().content(), &authorities)?;

        debug!(
            spiffe_id = %svid.spiffe_id(),
            expires_at = %credential.expires_at(),
            "Fetched SVID from agent"
        );
        Ok(credential)
    }
}

/// Build a credential from DER material, leaf first. Validity comes from
/// the leaf certificate.
fn credential_from_der(chain: &[&[u8]], key_der: &[u8], authorities: &[&[u8]]) -> Result<Credential> {
    let leaf = chain
        .first()
        .ok_or_else(|| Error::Agent("SVID has an empty certificate chain".to_string()))?;
    let (not_before, not_after) = crypto::validity_from_der(leaf)?;

    let chain_pem: String = chain.iter().map(|der| crypto::certificate_to_pem(der)).collect();
    let bundle_pem: String = authorities
        .iter()
        .map(|der| crypto::certificate_to_pem(der))
        .collect();
    let key_pem = Zeroizing::new(pem::encode(&pem::Pem::new("PRIVATE KEY", key_der.to_vec())));

    Credential::new(chain_pem, key_pem.as_str(), bundle_pem, not_before, not_after)
        .map_err(|e| Error::Agent(e.to_string()))
}

/// Poll the agent every `interval` and install changed credentials.
pub fn spawn_refresh(
    mut source: AgentSource,
    store: Arc<CredentialStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        // The store was just filled; skip the immediate first tick.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            match source.fetch().await {
                Ok(credential) => {
                    if credential != *store.get() {
                        let generation = store.set(credential);
                        info!(generation = generation, "Installed new SVID from agent");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Workload agent refresh failed");
                }
            }
        }

        debug!("Workload agent refresh stopped");
    })
}
