//! Request-level validation of peer certificates.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{async_trait, Router};
use tracing::{debug, warn};

use svidkit_client::IssuanceApi;
use svidkit_core::{AbsentCertificatePolicy, ServiceProfile, VerifiedPeer};

use super::peer::PeerCertificates;
use super::AuthenticationError;
use crate::crypto;

struct Policy {
    issuance: Arc<dyn IssuanceApi>,
    absent_certificate: AbsentCertificatePolicy,
    public_paths: Vec<String>,
}

/// Validation middleware state.
///
/// Every request's leaf certificate is submitted to the issuance service.
/// Requests whose certificate is rejected, or cannot be checked, never reach
/// the handler. Requests without a certificate are rejected unless the path
/// is public or the policy passes them through.
#[derive(Clone)]
pub struct ValidationLayer {
    policy: Arc<Policy>,
}

impl ValidationLayer {
    pub fn new(
        issuance: Arc<dyn IssuanceApi>,
        absent_certificate: AbsentCertificatePolicy,
        public_paths: Vec<String>,
    ) -> Self {
        Self {
            policy: Arc::new(Policy {
                issuance,
                absent_certificate,
                public_paths,
            }),
        }
    }

    pub fn from_profile(issuance: Arc<dyn IssuanceApi>, profile: &ServiceProfile) -> Self {
        Self::new(
            issuance,
            profile.absent_certificate(),
            profile.public_paths().to_vec(),
        )
    }

    /// Wrap every route of `router`, including its fallback.
    pub fn apply<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(axum::middleware::from_fn_with_state(self.clone(), validate))
    }

    /// Whether `path` is reachable without a certificate.
    ///
    /// An entry ending in `/` covers everything below it.
    pub fn is_public(&self, path: &str) -> bool {
        self.policy.public_paths.iter().any(|public| {
            path == public || (public.ends_with('/') && path.starts_with(public.as_str()))
        })
    }

    /// Authenticate one request.
    ///
    /// Returns the verified peer, or `None` when the request may proceed
    /// without an identity.
    pub async fn authenticate(
        &self,
        path: &str,
        certs: Option<&PeerCertificates>,
    ) -> Result<Option<VerifiedPeer>, AuthenticationError> {
        let public = self.is_public(path);

        let Some(leaf) = certs.and_then(PeerCertificates::leaf) else {
            if public || self.policy.absent_certificate == AbsentCertificatePolicy::PassThrough {
                debug!(path = %path, "No client certificate, forwarding without identity");
                return Ok(None);
            }
            debug!(path = %path, "No client certificate");
            return Err(AuthenticationError::MissingCertificate);
        };

        match self.verify(leaf).await {
            Ok(peer) => Ok(Some(peer)),
            Err(e) if public => {
                debug!(path = %path, error = %e, "Ignoring failed validation on public path");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn verify(&self, leaf: &[u8]) -> Result<VerifiedPeer, AuthenticationError> {
        let pem = crypto::certificate_to_pem(leaf);

        let result = self
            .policy
            .issuance
            .verify_certificate(&pem)
            .await
            .map_err(|e| {
                warn!(error = %e, "Certificate verification call failed");
                AuthenticationError::VerificationUnavailable
            })?;

        if !result.valid {
            warn!(
                spiffe_id = %result.spiffe_id,
                fingerprint = %crypto::fingerprint(leaf),
                "Client certificate rejected"
            );
            return Err(AuthenticationError::Rejected);
        }

        let peer = VerifiedPeer::try_from(result).map_err(|e| {
            warn!(error = %e, "Verified certificate carries no valid SPIFFE ID");
            AuthenticationError::InvalidIdentity
        })?;

        debug!(identity = %peer.identity, "Client authenticated");
        Ok(peer)
    }
}

/// Middleware function installed by [`ValidationLayer::apply`].
pub async fn validate(
    State(layer): State<ValidationLayer>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    let certs = request.extensions().get::<PeerCertificates>().cloned();

    match layer.authenticate(&path, certs.as_ref()).await {
        Ok(Some(peer)) => {
            request.extensions_mut().insert(peer);
            next.run(request).await
        }
        Ok(None) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

/// Extractor for the authenticated caller.
///
/// Rejects with 401 when the request carries no verified identity. Use
/// `Option<Caller>` on routes that also serve anonymous callers.
#[derive(Debug, Clone)]
pub struct Caller(pub VerifiedPeer);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AuthenticationError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<VerifiedPeer>()
            .cloned()
            .map(Caller)
            .ok_or(AuthenticationError::MissingCertificate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::get;
    use svidkit_client::IssuanceError;
    use svidkit_core::{Credential, SpiffeId, ValidationResult, WorkloadHandle};
    use tower::ServiceExt;

    enum Verdict {
        Valid(&'static str),
        Invalid,
        Unavailable,
    }

    struct FakeVerifier {
        verdict: Verdict,
        calls: AtomicU32,
        seen: Mutex<Vec<String>>,
    }

    impl FakeVerifier {
        fn new(verdict: Verdict) -> Arc<Self> {
            Arc::new(Self {
                verdict,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl IssuanceApi for FakeVerifier {
        async fn register(&self, _: &SpiffeId, _: &str, _: &[String]) -> Result<(), IssuanceError> {
            unreachable!()
        }

        async fn lookup_workload_handle(
            &self,
            _: &SpiffeId,
        ) -> Result<WorkloadHandle, IssuanceError> {
            unreachable!()
        }

        async fn fetch_credential(&self, _: &WorkloadHandle) -> Result<Credential, IssuanceError> {
            unreachable!()
        }

        async fn verify_certificate(&self, pem: &str) -> Result<ValidationResult, IssuanceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(pem.to_string());
            match self.verdict {
                Verdict::Valid(id) => Ok(ValidationResult {
                    valid: true,
                    spiffe_id: id.to_string(),
                    subject: "O=SPIRE".to_string(),
                    issuer: "CN=authsec CA".to_string(),
                    not_before: String::new(),
                    not_after: "2026-10-16T11:00:00Z".to_string(),
                }),
                Verdict::Invalid => Ok(ValidationResult {
                    valid: false,
                    spiffe_id: String::new(),
                    subject: String::new(),
                    issuer: String::new(),
                    not_before: String::new(),
                    not_after: String::new(),
                }),
                Verdict::Unavailable => Err(IssuanceError::Status {
                    operation: "verify_certificate",
                    status: 503,
                    body: String::new(),
                }),
            }
        }
    }

    fn app(layer: &ValidationLayer, hits: Arc<AtomicU32>) -> Router {
        let router = Router::new()
            .route(
                "/whoami",
                get(|Caller(peer): Caller| async move { peer.identity.to_string() }),
            )
            .route(
                "/health",
                get(|caller: Option<Caller>| async move {
                    match caller {
                        Some(Caller(peer)) => format!("ok {}", peer.identity),
                        None => "ok".to_string(),
                    }
                }),
            )
            .route_layer(axum::middleware::from_fn(
                move |request: Request, next: Next| {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        next.run(request).await
                    }
                },
            ));
        layer.apply(router)
    }

    fn request(path: &str, certs: Option<PeerCertificates>) -> HttpRequest<Body> {
        let mut request = HttpRequest::builder().uri(path).body(Body::empty()).unwrap();
        if let Some(certs) = certs {
            request.extensions_mut().insert(certs);
        }
        request
    }

    fn leaf() -> PeerCertificates {
        PeerCertificates::new(vec![vec![0x30, 0x03, 0x02, 0x01, 0x01]])
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn reject_layer(issuance: Arc<FakeVerifier>) -> ValidationLayer {
        ValidationLayer::new(
            issuance,
            AbsentCertificatePolicy::Reject,
            vec!["/health".to_string()],
        )
    }

    #[tokio::test]
    async fn test_valid_certificate_reaches_handler_with_identity() {
        let verifier = FakeVerifier::new(Verdict::Valid("spiffe://authsec.dev/payment-service"));
        let hits = Arc::new(AtomicU32::new(0));
        let app = app(&reject_layer(verifier.clone()), hits.clone());

        let response = app.oneshot(request("/whoami", Some(leaf()))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_string(response).await,
            "spiffe://authsec.dev/payment-service"
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The leaf was submitted as PEM.
        let seen = verifier.seen.lock().unwrap();
        assert!(seen[0].starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn test_invalid_certificate_is_rejected() {
        let verifier = FakeVerifier::new(Verdict::Invalid);
        let hits = Arc::new(AtomicU32::new(0));
        let app = app(&reject_layer(verifier), hits.clone());

        let response = app.oneshot(request("/whoami", Some(leaf()))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_string(response).await.contains("\"error\""));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_verification_failure_fails_closed() {
        let verifier = FakeVerifier::new(Verdict::Unavailable);
        let hits = Arc::new(AtomicU32::new(0));
        let app = app(&reject_layer(verifier), hits.clone());

        let response = app.oneshot(request("/whoami", Some(leaf()))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_valid_result_without_spiffe_id_is_rejected() {
        let verifier = FakeVerifier::new(Verdict::Valid("not-a-spiffe-id"));
        let hits = Arc::new(AtomicU32::new(0));
        let app = app(&reject_layer(verifier), hits.clone());

        let response = app.oneshot(request("/whoami", Some(leaf()))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_certificate_is_rejected_by_default() {
        let verifier = FakeVerifier::new(Verdict::Valid("spiffe://authsec.dev/a"));
        let hits = Arc::new(AtomicU32::new(0));
        let app = app(&reject_layer(verifier.clone()), hits.clone());

        let response = app
            .oneshot(request("/whoami", Some(PeerCertificates::default())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_public_path_allows_anonymous() {
        let verifier = FakeVerifier::new(Verdict::Invalid);
        let hits = Arc::new(AtomicU32::new(0));
        let layer = reject_layer(verifier);

        let response = app(&layer, hits.clone())
            .oneshot(request("/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "ok");

        // A rejected certificate on a public path degrades to anonymous.
        let response = app(&layer, hits.clone())
            .oneshot(request("/health", Some(leaf())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pass_through_policy_forwards_without_identity() {
        let verifier = FakeVerifier::new(Verdict::Invalid);
        let hits = Arc::new(AtomicU32::new(0));
        let layer = ValidationLayer::new(verifier, AbsentCertificatePolicy::PassThrough, vec![]);

        // The handler requires an identity, so the extractor answers 401
        // after the middleware let the request through.
        let response = app(&layer, hits.clone())
            .oneshot(request("/whoami", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_public_path_matching() {
        let layer = ValidationLayer::new(
            FakeVerifier::new(Verdict::Invalid),
            AbsentCertificatePolicy::Reject,
            vec!["/health".to_string(), "/public/".to_string()],
        );

        assert!(layer.is_public("/health"));
        assert!(!layer.is_public("/healthz"));
        assert!(layer.is_public("/public/docs"));
        assert!(!layer.is_public("/publicity"));
    }
}
