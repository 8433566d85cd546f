use crate::client::UpstreamClient;
use crate::error::{json_error_response, Error, ProxyErrorCode, Result};
use crate::routes::{is_valid_hostname, strip_port, BaseUrl, RouteTable};
use crate::shutdown::LifecycleState;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response, Uri, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Delay before accepting again after a failed accept (e.g. out of fds)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Per-request state machine: resolve, forward, relay, complete.
///
/// Holds no per-request state; one instance serves every connection.
pub struct Dispatcher {
    routes: Arc<RouteTable>,
    client: UpstreamClient,
}

impl Dispatcher {
    pub fn new(routes: Arc<RouteTable>, client: UpstreamClient) -> Self {
        Self { routes, client }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Handle one inbound request. Every outcome is a response; nothing is
    /// dropped silently.
    pub async fn dispatch<B>(&self, req: Request<B>, client_addr: SocketAddr, is_tls: bool) -> Response<ProxyBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Resolve
        let hostname = match extract_hostname(&req) {
            Some(h) => h,
            None => {
                warn!(method = %method, path = %path, request_id = %request_id, status = 400, "Missing or invalid Host header");
                return json_error_response(
                    ProxyErrorCode::MissingHostHeader,
                    "Missing or invalid Host header",
                );
            }
        };

        let base = match self.routes.resolve(&hostname) {
            Ok(base) => base.clone(),
            Err(e) => {
                warn!(
                    method = %method,
                    hostname = %hostname,
                    path = %path,
                    request_id = %request_id,
                    status = 502,
                    "No route for host"
                );
                return json_error_response(ProxyErrorCode::UnknownHost, e.to_string());
            }
        };

        // Forward
        let outbound = match build_outbound(req, &base, client_addr, is_tls, &request_id) {
            Ok(outbound) => outbound,
            Err(e) => {
                error!(
                    method = %method,
                    hostname = %hostname,
                    path = %path,
                    target = %base,
                    error = %e,
                    "Failed to build upstream request"
                );
                return json_error_response(ProxyErrorCode::InvalidUpstreamRequest, "Invalid upstream request");
            }
        };

        // Relay
        let response = match self.client.send(&base, outbound).await {
            Ok(response) => response,
            Err(e) => {
                let code = if e.is_timeout() {
                    ProxyErrorCode::UpstreamTimeout
                } else {
                    ProxyErrorCode::UpstreamUnavailable
                };
                error!(
                    method = %method,
                    hostname = %hostname,
                    path = %path,
                    target = %base,
                    request_id = %request_id,
                    status = code.status_code().as_u16(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    error = %e,
                    "Upstream request failed"
                );
                return json_error_response(code, format!("Upstream {} unavailable", hostname));
            }
        };

        // Complete
        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        info!(
            method = %method,
            hostname = %hostname,
            path = %path,
            target = %base,
            request_id = %request_id,
            status = parts.status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Proxied request"
        );

        let body = body
            .map_err(move |e| {
                warn!(hostname = %hostname, path = %path, error = %e, "Upstream body failed after status was sent");
                e
            })
            .boxed();

        Response::from_parts(parts, body)
    }
}

/// Build the outbound request for `base`: same method and body, origin-form
/// URI, hop-by-hop headers removed, Host rewritten, forwarding headers set.
fn build_outbound<B>(
    req: Request<B>,
    base: &BaseUrl,
    client_addr: SocketAddr,
    is_tls: bool,
    request_id: &str,
) -> std::result::Result<Request<B>, http::Error> {
    let (mut parts, body) = req.into_parts();

    let original_host = parts
        .headers
        .get(HOST)
        .cloned()
        .or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/");
    parts.uri = Uri::builder().path_and_query(path_and_query).build()?;
    parts.version = Version::HTTP_11;

    let headers = &mut parts.headers;
    strip_hop_by_hop(headers);

    headers.insert(HOST, HeaderValue::from_str(base.authority().as_str())?);

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    // Append to any chain the caller already sent
    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }

    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    Ok(Request::from_parts(parts, body))
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Hostname from the Host header, or from the URI authority (HTTP/2),
/// lowercased and with any port stripped.
pub fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let host = match req.headers().get(HOST) {
        Some(value) => value.to_str().ok()?,
        None => req.uri().authority()?.as_str(),
    };

    let hostname = strip_port(host.trim());

    // Rejecting anything else also keeps control characters out of the logs
    if !is_valid_hostname(hostname) {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

/// URL a service is reachable at through the proxy
pub fn service_url(hostname: &str, tls: bool, port: u16) -> String {
    match (tls, port) {
        (true, 443) | (false, 80) => format!("{}://{}/", if tls { "https" } else { "http" }, hostname),
        _ => format!("{}://{}:{}/", if tls { "https" } else { "http" }, hostname, port),
    }
}

/// The listener loop
pub struct ProxyServer {
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<LifecycleState>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(
        routes: Arc<RouteTable>,
        client: UpstreamClient,
        shutdown_rx: watch::Receiver<LifecycleState>,
    ) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(routes, client)),
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(addr).await.map_err(|source| Error::Listener {
            addr: addr.to_string(),
            source,
        })
    }

    /// Accept connections until the lifecycle leaves `Running`
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().map_err(|source| Error::Listener {
            addr: "unbound".to_string(),
            source,
        })?;
        let protocol = if self.tls_enabled() { "HTTPS" } else { "HTTP" };
        info!(
            addr = %addr,
            protocol,
            routes = self.dispatcher.routes().len(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if *shutdown_rx.borrow_and_update() != LifecycleState::Running {
                info!("Proxy server shutting down");
                break;
            }

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let tls_acceptor = self.tls_acceptor.clone();

                            tokio::spawn(async move {
                                let _ = stream.set_nodelay(true);
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, client_addr, dispatcher, true).await {
                                                debug!(addr = %client_addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %client_addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, client_addr, dispatcher, false).await {
                                    debug!(addr = %client_addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    client_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { Ok::<_, Infallible>(dispatcher.dispatch(req, client_addr, is_tls).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
