//! Shared fixtures: a CA and an in-process issuance service.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::TimeDelta;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, Ia5String, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use serde::Deserialize;
use serde_json::json;

use svidkit::{crypto, Clock, ManualClock, ServiceProfile};

// ============================================================================
// Certificate authority
// ============================================================================

pub struct TestCa {
    cert: Certificate,
    key_pair: KeyPair,
}

pub struct IssuedLeaf {
    pub cert_pem: String,
    pub key_pem: String,
    pub der: Vec<u8>,
}

impl TestCa {
    pub fn new() -> Self {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "authsec test CA");
        dn.push(DnType::OrganizationName, "authsec");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        Self { cert, key_pair }
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn issue(&self, spiffe_id: &str) -> IssuedLeaf {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "SPIRE");
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::URI(Ia5String::try_from(spiffe_id).unwrap())];

        let key_pair = KeyPair::generate().unwrap();
        let cert = params
            .signed_by(&key_pair, &self.cert, &self.key_pair)
            .unwrap();

        IssuedLeaf {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            der: cert.der().to_vec(),
        }
    }
}

// ============================================================================
// Fake issuance service
// ============================================================================

/// Knobs and counters of the fake issuance service.
pub struct IssuanceState {
    ca: TestCa,
    clock: Arc<ManualClock>,
    workloads: Mutex<HashMap<String, String>>,
    issued: Mutex<HashSet<String>>,
    pub registrations: AtomicU32,
    pub lookups: AtomicU32,
    pub fetches: AtomicU32,
    pub verifications: AtomicU32,
    /// Verifications received on the `/api/v1` root.
    pub root_verifications: AtomicU32,
    pub fail_register: AtomicBool,
    pub fail_fetch: AtomicBool,
    pub fetch_delay: Mutex<Duration>,
}

impl IssuanceState {
    pub fn ca_pem(&self) -> String {
        self.ca.cert_pem()
    }

    /// Move a registered workload to a new handle. The old handle stops
    /// resolving.
    pub fn rekey(&self, from: &str, to: &str) {
        let mut workloads = self.workloads.lock().unwrap();
        let spiffe_id = workloads.remove(from).expect("workload registered");
        workloads.insert(to.to_string(), spiffe_id);
    }

    /// Issue a leaf signed by the service CA without registering it as
    /// issued, so verification rejects it.
    pub fn forge(&self, spiffe_id: &str) -> IssuedLeaf {
        self.ca.issue(spiffe_id)
    }
}

pub struct FakeIssuance {
    pub addr: SocketAddr,
    pub state: Arc<IssuanceState>,
}

impl FakeIssuance {
    pub fn endpoint(&self) -> String {
        format!("http://{}/spiresvc/api/v1", self.addr)
    }

    /// Root that serves certificate verification outside the workload API.
    pub fn verify_endpoint(&self) -> String {
        format!("http://{}/api/v1", self.addr)
    }
}

#[derive(Deserialize)]
struct RegisterBody {
    spiffe_id: String,
    #[serde(rename = "type")]
    workload_type: String,
    selectors: Vec<String>,
}

#[derive(Deserialize)]
struct LookupQuery {
    spiffe_id: String,
}

#[derive(Deserialize)]
struct VerifyBody {
    certificate: String,
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn register(State(state): State<Arc<IssuanceState>>, Json(body): Json<RegisterBody>) -> Response {
    if state.fail_register.load(Ordering::SeqCst) {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "registration backend down");
    }
    if body.workload_type.is_empty() || body.selectors.is_empty() {
        return error(StatusCode::BAD_REQUEST, "type and selectors are required");
    }

    let n = state.registrations.fetch_add(1, Ordering::SeqCst) + 1;
    state
        .workloads
        .lock()
        .unwrap()
        .insert(format!("wl-{}", n), body.spiffe_id);
    StatusCode::CREATED.into_response()
}

async fn lookup(
    State(state): State<Arc<IssuanceState>>,
    Query(query): Query<LookupQuery>,
) -> Response {
    state.lookups.fetch_add(1, Ordering::SeqCst);
    let workloads: Vec<_> = state
        .workloads
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, spiffe_id)| **spiffe_id == query.spiffe_id)
        .map(|(id, spiffe_id)| json!({ "id": id, "spiffe_id": spiffe_id }))
        .collect();
    Json(json!({ "workloads": workloads })).into_response()
}

async fn fetch(State(state): State<Arc<IssuanceState>>, Path(id): Path<String>) -> Response {
    state.fetches.fetch_add(1, Ordering::SeqCst);

    let delay = *state.fetch_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if state.fail_fetch.load(Ordering::SeqCst) {
        return error(StatusCode::SERVICE_UNAVAILABLE, "signing backend down");
    }

    let Some(spiffe_id) = state.workloads.lock().unwrap().get(&id).cloned() else {
        return error(StatusCode::NOT_FOUND, "unknown workload");
    };

    let leaf = state.ca.issue(&spiffe_id);
    state
        .issued
        .lock()
        .unwrap()
        .insert(crypto::fingerprint(&leaf.der));

    let issued_at = state.clock.now();
    (
        StatusCode::CREATED,
        Json(json!({
            "x509_svid": leaf.cert_pem,
            "private_key": leaf.key_pem,
            "bundle": state.ca.cert_pem(),
            "issued_at": issued_at.to_rfc3339(),
            "expires_at": (issued_at + TimeDelta::hours(1)).to_rfc3339(),
        })),
    )
        .into_response()
}

async fn verify(State(state): State<Arc<IssuanceState>>, Json(body): Json<VerifyBody>) -> Response {
    state.verifications.fetch_add(1, Ordering::SeqCst);

    let Ok(der) = crypto::first_certificate_der(&body.certificate) else {
        return Json(json!({ "valid": false })).into_response();
    };
    let known = state
        .issued
        .lock()
        .unwrap()
        .contains(&crypto::fingerprint(&der));
    let spiffe_id = crypto::spiffe_id_from_der(&der)
        .map(|id| id.to_string())
        .unwrap_or_default();

    Json(json!({
        "valid": known,
        "spiffe_id": spiffe_id,
        "subject": "O=SPIRE",
        "issuer": "CN=authsec test CA,O=authsec",
        "not_before": "",
        "not_after": "",
    }))
    .into_response()
}

async fn verify_at_root(
    State(state): State<Arc<IssuanceState>>,
    body: Json<VerifyBody>,
) -> Response {
    state.root_verifications.fetch_add(1, Ordering::SeqCst);
    verify(State(state), body).await
}

/// Start the fake issuance service on an ephemeral port.
pub async fn spawn_issuance(clock: Arc<ManualClock>) -> FakeIssuance {
    let state = Arc::new(IssuanceState {
        ca: TestCa::new(),
        clock,
        workloads: Mutex::new(HashMap::new()),
        issued: Mutex::new(HashSet::new()),
        registrations: AtomicU32::new(0),
        lookups: AtomicU32::new(0),
        fetches: AtomicU32::new(0),
        verifications: AtomicU32::new(0),
        root_verifications: AtomicU32::new(0),
        fail_register: AtomicBool::new(false),
        fail_fetch: AtomicBool::new(false),
        fetch_delay: Mutex::new(Duration::ZERO),
    });

    let app = Router::new()
        .route("/spiresvc/api/v1/workloads/register-and-issue", post(register))
        .route("/spiresvc/api/v1/workloads", get(lookup))
        .route("/spiresvc/api/v1/workloads/:id/svid", post(fetch))
        .route("/spiresvc/api/v1/verify/certificate", post(verify))
        .route("/api/v1/verify/certificate", post(verify_at_root))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeIssuance { addr, state }
}

/// Profile for `name` in the `authsec.dev` trust domain. Background checks
/// are spaced far apart so tests drive renewal through explicit ticks.
pub fn profile(issuance: &FakeIssuance, name: &str) -> ServiceProfile {
    ServiceProfile::builder(format!("spiffe://authsec.dev/{}", name))
        .selector("k8s:ns:authsec")
        .selector(format!("k8s:sa:{}", name))
        .issuance_endpoint(issuance.endpoint())
        .renewal_threshold(Duration::from_secs(300))
        .check_interval(Duration::from_secs(3600))
        .issuance_timeout(Duration::from_secs(5))
        .outbound_timeout(Duration::from_secs(5))
        .internal_domain("127.0.0.1")
        .public_path("/health")
        .build()
        .unwrap()
}
