//! Sending caller-built requests with the workload identity attached.

use std::sync::Arc;

use reqwest::{Request, Response};
use tracing::debug;

use crate::error::{Error, Result};
use crate::router::MutualTransport;

/// Dispatches a copy of a caller's request over mutual TLS.
///
/// The caller's request is never modified and can be reused afterwards.
#[derive(Clone)]
pub struct OutgoingAttachment {
    mutual: Arc<MutualTransport>,
}

impl OutgoingAttachment {
    pub fn new(mutual: Arc<MutualTransport>) -> Self {
        Self { mutual }
    }

    /// Send a clone of `request`. Requests with streaming bodies cannot be
    /// cloned and fail with [`Error::NonCloneableRequest`].
    pub async fn execute(&self, request: &Request) -> Result<Response> {
        let attached = request.try_clone().ok_or(Error::NonCloneableRequest)?;
        debug!(
            method = %attached.method(),
            url = %attached.url(),
            "Sending request with workload identity"
        );
        self.mutual.execute(attached).await
    }
}
