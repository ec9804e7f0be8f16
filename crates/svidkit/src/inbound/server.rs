//! Mutual TLS server that follows credential renewals.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::peer::PeerCertAcceptor;
use crate::error::{Error, Result};
use crate::store::CredentialStore;
use crate::tls;

/// How long in-flight requests may run once shutdown starts.
const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(10);

/// Serves a router over TLS with the current credential.
///
/// The server certificate is swapped in place whenever the store's
/// generation changes; existing connections keep their handshake.
pub struct IdentityServer {
    store: Arc<CredentialStore>,
    config: RustlsConfig,
    handle: Handle,
    cancel: CancellationToken,
}

impl IdentityServer {
    pub fn new(store: Arc<CredentialStore>, cancel: CancellationToken) -> Result<Self> {
        let config = RustlsConfig::from_config(Arc::new(tls::server_config(&store.get())?));
        Ok(Self {
            store,
            config,
            handle: Handle::new(),
            cancel,
        })
    }

    /// Handle for observing the bound address or stopping the server.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Serve `app` on `addr` until the cancellation token fires.
    pub async fn serve(self, addr: SocketAddr, app: Router) -> Result<()> {
        let reload = tokio::spawn(reload_on_renewal(
            self.store.clone(),
            self.config.clone(),
            self.cancel.clone(),
        ));

        let shutdown = {
            let handle = self.handle.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));
            })
        };

        info!(addr = %addr, "Starting mutual TLS server");

        let result = axum_server::bind(addr)
            .acceptor(PeerCertAcceptor::new(self.config))
            .handle(self.handle)
            .serve(app.into_make_service())
            .await
            .map_err(Error::Server);

        reload.abort();
        shutdown.abort();

        info!(addr = %addr, "Mutual TLS server stopped");
        result
    }
}

async fn reload_on_renewal(
    store: Arc<CredentialStore>,
    config: RustlsConfig,
    cancel: CancellationToken,
) {
    let mut generations = store.subscribe();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = generations.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let generation = *generations.borrow_and_update();
        match tls::server_config(&store.get()) {
            Ok(server_config) => {
                config.reload_from_config(Arc::new(server_config));
                info!(generation = generation, "Reloaded server certificate");
            }
            Err(e) => {
                warn!(
                    generation = generation,
                    error = %e,
                    "Failed to rebuild server TLS config, keeping previous certificate"
                );
            }
        }
    }
}
