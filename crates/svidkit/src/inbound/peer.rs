//! Capture of peer certificates at the TLS layer.

use std::io;

use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower_http::add_extension::AddExtension;

/// Certificate chain the peer presented during the handshake, leaf first.
///
/// Attached to every request of the connection. Empty when the peer sent no
/// certificate.
#[derive(Clone, Debug, Default)]
pub struct PeerCertificates(Vec<Vec<u8>>);

impl PeerCertificates {
    pub fn new(certs: Vec<Vec<u8>>) -> Self {
        Self(certs)
    }

    /// DER bytes of the peer's own certificate.
    pub fn leaf(&self) -> Option<&[u8]> {
        self.0.first().map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// TLS acceptor that attaches [`PeerCertificates`] to the connection's
/// requests.
#[derive(Clone)]
pub struct PeerCertAcceptor {
    inner: RustlsAcceptor,
}

impl PeerCertAcceptor {
    pub fn new(config: RustlsConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(config),
        }
    }
}

impl<I, S> Accept<I, S> for PeerCertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, PeerCertificates>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;

            let (_, connection) = stream.get_ref();
            let certs = connection
                .peer_certificates()
                .map(|chain| chain.iter().map(|c| c.as_ref().to_vec()).collect())
                .unwrap_or_default();

            Ok((stream, AddExtension::new(service, PeerCertificates::new(certs))))
        })
    }
}
