//! Outbound HTTP client for forwarded upstreams
//!
//! One [`UpstreamClient`] is built at startup and injected into the
//! dispatcher. It owns the process-wide TLS verification decision and the
//! per-request timeout. Every exchange opens its own connection to the local
//! end of a forwarding channel; the connection task lives exactly as long as
//! the request future and, after the response head arrives, the response
//! body. Dropping either one (for instance because the caller disconnected)
//! tears the upstream connection down.

use crate::routes::BaseUrl;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Errors from a single upstream exchange
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TLS server name '{0}'")]
    InvalidServerName(String),
    #[error("TLS handshake with {addr} failed: {source}")]
    Tls {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP handshake failed: {0}")]
    Handshake(#[source] hyper::Error),
    #[error("upstream exchange failed: {0}")]
    Exchange(#[source] hyper::Error),
    #[error("no response within {}s", .0.as_secs())]
    Timeout(Duration),
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::Timeout(_))
    }
}

/// Configuration for the upstream client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Skip certificate verification for https upstreams
    pub insecure: bool,
    /// Bound on connect + TLS + waiting for the response head
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            insecure: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared client used by every request
#[derive(Clone)]
pub struct UpstreamClient {
    tls: TlsConnector,
    config: ClientConfig,
}

impl UpstreamClient {
    pub fn new(config: ClientConfig) -> Result<Self, rustls::Error> {
        let tls = tls_connector(config.insecure)?;

        debug!(
            insecure = config.insecure,
            request_timeout_secs = config.request_timeout.as_secs(),
            "Upstream client initialized"
        );

        Ok(Self { tls, config })
    }

    /// Send `req` to `base`. The request URI must be in origin form.
    pub async fn send<B>(
        &self,
        base: &BaseUrl,
        req: Request<B>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, UpstreamError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, self.exchange(base, req)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(timeout)),
        }
    }

    async fn exchange<B>(
        &self,
        base: &BaseUrl,
        req: Request<B>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, UpstreamError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let host = base.host().trim_start_matches('[').trim_end_matches(']');
        let addr = base.authority().to_string();

        let stream = TcpStream::connect((host, base.port()))
            .await
            .map_err(|source| UpstreamError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        if base.is_https() {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| UpstreamError::InvalidServerName(host.to_string()))?;
            let stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|source| UpstreamError::Tls { addr, source })?;
            send_over(stream, req).await
        } else {
            send_over(stream, req).await
        }
    }
}

async fn send_over<S, B>(
    stream: S,
    req: Request<B>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(UpstreamError::Handshake)?;

    let conn_task = AbortOnDrop(tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Upstream connection closed with error");
        }
    }));

    let response = sender.send_request(req).await.map_err(UpstreamError::Exchange)?;

    let (parts, body) = response.into_parts();
    let body = UpstreamBody {
        inner: body,
        _conn: conn_task,
    };
    Ok(Response::from_parts(parts, body.boxed()))
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Upstream response body that keeps its connection task alive
struct UpstreamBody {
    inner: Incoming,
    _conn: AbortOnDrop,
}

impl Body for UpstreamBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn tls_connector(insecure: bool) -> Result<TlsConnector, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let mut config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    // Upstream connections are always HTTP/1.1
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts any server certificate; handshake signatures are still checked.
#[derive(Debug)]
struct InsecureVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
