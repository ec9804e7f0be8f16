//! svidkit sidecar
//!
//! Obtains a workload identity and serves a small mutual TLS API with it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use svidkit::inbound::{Caller, ValidationLayer};
use svidkit::{ProfileFile, WorkloadIdentity};

/// Workload identity sidecar.
#[derive(Parser, Debug)]
#[command(name = "svidkit-sidecar", about = "Workload identity sidecar serving mutual TLS")]
struct Args {
    /// Path to the service profile (JSON)
    #[arg(long, env = "SVIDKIT_PROFILE", default_value = "profile.json")]
    profile: PathBuf,

    /// Address for the mutual TLS listener
    #[arg(long, env = "SVIDKIT_LISTEN", default_value = "0.0.0.0:8443")]
    listen: SocketAddr,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    identity: String,
    expires_at: String,
    expired: bool,
}

#[derive(Debug, Serialize)]
struct WhoamiResponse {
    spiffe_id: String,
    subject: String,
    issuer: String,
    not_after: String,
}

async fn health(State(identity): State<Arc<WorkloadIdentity>>) -> Json<HealthResponse> {
    let credential = identity.credential();
    Json(HealthResponse {
        status: "ok",
        identity: identity.profile().identity().to_string(),
        expires_at: credential.expires_at().to_rfc3339(),
        expired: identity.credential_expired(),
    })
}

async fn whoami(Caller(peer): Caller) -> Json<WhoamiResponse> {
    Json(WhoamiResponse {
        spiffe_id: peer.identity.to_string(),
        subject: peer.subject,
        issuer: peer.issuer,
        not_after: peer.not_after,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let profile = ProfileFile::load(&args.profile).map_err(|e| {
        format!(
            "Failed to load profile from '{}': {}",
            args.profile.display(),
            e
        )
    })?;

    info!(
        identity = %profile.identity(),
        endpoint = %profile.issuance_endpoint(),
        listen = %args.listen,
        "Starting svidkit sidecar"
    );

    let identity = Arc::new(WorkloadIdentity::initialize(profile).await?);

    // The health endpoint stays reachable without a client certificate.
    let mut public_paths = identity.profile().public_paths().to_vec();
    public_paths.push("/health".to_string());
    let validation = ValidationLayer::new(
        identity.issuance(),
        identity.profile().absent_certificate(),
        public_paths,
    );

    let app = Router::new()
        .route("/health", get(health))
        .route("/whoami", get(whoami))
        .with_state(identity.clone())
        .layer(TraceLayer::new_for_http());

    let server = tokio::spawn(identity.server()?.serve(args.listen, validation.apply(app)));

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");

    identity.shutdown().await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Server error"),
        Err(e) => error!(error = %e, "Server task failed"),
    }

    info!("svidkit sidecar stopped");
    Ok(())
}
