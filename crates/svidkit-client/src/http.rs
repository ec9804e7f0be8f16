//! HTTP implementation of the issuance protocol.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use svidkit_core::{Credential, SpiffeId, ValidationResult, WorkloadHandle};

use crate::api::IssuanceApi;
use crate::error::IssuanceError;
use crate::types::{RegisterRequest, SvidResponse, VerifyRequest, WorkloadList};

/// HTTP client for the identity issuance service.
#[derive(Clone)]
pub struct IssuanceClient {
    inner: reqwest::Client,
    base_url: Url,
    verify_url: Option<Url>,
}

impl IssuanceClient {
    /// Create a new client. Every call is bounded by `timeout`.
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, IssuanceError> {
        check_base(&base_url)?;

        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IssuanceError::Config(e.to_string()))?;

        Ok(Self {
            inner,
            base_url,
            verify_url: None,
        })
    }

    /// Send certificate verification to `verify_url` instead of the
    /// issuance endpoint.
    pub fn with_verify_endpoint(mut self, verify_url: Url) -> Result<Self, IssuanceError> {
        check_base(&verify_url)?;
        self.verify_url = Some(verify_url);
        Ok(self)
    }

    /// The configured issuance endpoint.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Base URL used for certificate verification.
    pub fn verify_url(&self) -> &Url {
        self.verify_url.as_ref().unwrap_or(&self.base_url)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, IssuanceError> {
        join(&self.base_url, segments)
    }
}

fn check_base(url: &Url) -> Result<(), IssuanceError> {
    if url.cannot_be_a_base() {
        return Err(IssuanceError::Config(format!(
            "issuance endpoint '{}' cannot be used as a base URL",
            url
        )));
    }
    Ok(())
}

fn join(base: &Url, segments: &[&str]) -> Result<Url, IssuanceError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| IssuanceError::Config(format!("invalid base URL '{}'", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[async_trait]
impl IssuanceApi for IssuanceClient {
    async fn register(
        &self,
        identity: &SpiffeId,
        workload_type: &str,
        selectors: &[String],
    ) -> Result<(), IssuanceError> {
        const OP: &str = "register";
        let url = self.endpoint(&["workloads", "register-and-issue"])?;
        debug!(url = %url, identity = %identity, selectors = selectors.len(), "POST register");

        let body = RegisterRequest {
            spiffe_id: identity.to_string(),
            workload_type: workload_type.to_string(),
            selectors: selectors.to_vec(),
        };

        let response = self
            .inner
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|source| IssuanceError::Network { operation: OP, source })?;

        expect_status(response, StatusCode::CREATED, OP).await?;
        Ok(())
    }

    async fn lookup_workload_handle(
        &self,
        identity: &SpiffeId,
    ) -> Result<WorkloadHandle, IssuanceError> {
        const OP: &str = "lookup";
        let url = self.endpoint(&["workloads"])?;
        debug!(url = %url, identity = %identity, "GET workloads");

        let response = self
            .inner
            .get(url)
            .query(&[("spiffe_id", identity.as_str())])
            .send()
            .await
            .map_err(|source| IssuanceError::Network { operation: OP, source })?;

        let response = expect_status(response, StatusCode::OK, OP).await?;
        let list: WorkloadList = decode(response, OP).await?;

        let mut entries = list.workloads.into_iter();
        let first = entries
            .next()
            .ok_or_else(|| IssuanceError::NotFound(identity.to_string()))?;

        // The service filters by spiffe_id already; prefer an exact match if
        // it returned more than one entry.
        let entry = if first.spiffe_id == identity.as_str() {
            first
        } else {
            match entries.find(|e| e.spiffe_id == identity.as_str()) {
                Some(exact) => exact,
                None => {
                    warn!(
                        identity = %identity,
                        returned = %first.spiffe_id,
                        "Lookup returned no exact match, using first workload"
                    );
                    first
                }
            }
        };

        Ok(WorkloadHandle::new(entry.id))
    }

    async fn fetch_credential(
        &self,
        handle: &WorkloadHandle,
    ) -> Result<Credential, IssuanceError> {
        const OP: &str = "fetch_credential";
        let url = self.endpoint(&["workloads", handle.as_str(), "svid"])?;
        debug!(url = %url, handle = %handle, "POST svid");

        let response = self
            .inner
            .post(url)
            .send()
            .await
            .map_err(|source| IssuanceError::Network { operation: OP, source })?;

        let response = expect_status(response, StatusCode::CREATED, OP).await?;
        let svid: SvidResponse = decode(response, OP).await?;

        Credential::new(
            svid.x509_svid,
            svid.private_key,
            svid.bundle,
            svid.issued_at,
            svid.expires_at,
        )
        .map_err(|e| IssuanceError::Decode {
            operation: OP,
            reason: e.to_string(),
        })
    }

    async fn verify_certificate(
        &self,
        certificate_pem: &str,
    ) -> Result<ValidationResult, IssuanceError> {
        const OP: &str = "verify_certificate";
        let url = join(self.verify_url(), &["verify", "certificate"])?;
        debug!(url = %url, "POST verify");

        let body = VerifyRequest {
            certificate: certificate_pem.to_string(),
        };

        let response = self
            .inner
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|source| IssuanceError::Network { operation: OP, source })?;

        let response = expect_status(response, StatusCode::OK, OP).await?;
        decode(response, OP).await
    }
}

/// Fail with [`IssuanceError::Status`] unless the response has `expected`.
async fn expect_status(
    response: Response,
    expected: StatusCode,
    operation: &'static str,
) -> Result<Response, IssuanceError> {
    if response.status() == expected {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(IssuanceError::Status {
        operation,
        status,
        body,
    })
}

/// Read the whole body, then decode it as JSON.
async fn decode<T: DeserializeOwned>(
    response: Response,
    operation: &'static str,
) -> Result<T, IssuanceError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|source| IssuanceError::Network { operation, source })?;

    serde_json::from_slice(&bytes).map_err(|e| IssuanceError::Decode {
        operation,
        reason: e.to_string(),
    })
}
