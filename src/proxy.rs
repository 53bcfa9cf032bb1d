//! The reverse proxy server
//!
//! Terminates public connections and forwards each request to the fixed
//! upstream address, relaying the response back unchanged. Per-request
//! lifecycle is ACCEPTED -> FORWARDING -> RESPONDING -> CLOSED; upstream
//! failures short-circuit to CLOSED after the appropriate error status.

use crate::error::{json_error_response, ProxyErrorCode};
use crate::forward::{ForwardError, Forwarder, ForwarderConfig};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Default bound on how long a client may take to send its request headers
const DEFAULT_CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// The main reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    forwarder: Arc<Forwarder>,
    request_timeout: Duration,
    client_idle_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        upstream_addr: SocketAddr,
        request_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_forwarder_config(
            bind_addr,
            upstream_addr,
            request_timeout,
            shutdown_rx,
            ForwarderConfig::default(),
        )
    }

    pub fn with_forwarder_config(
        bind_addr: SocketAddr,
        upstream_addr: SocketAddr,
        request_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
        forwarder_config: ForwarderConfig,
    ) -> Self {
        let forwarder = Arc::new(Forwarder::new(upstream_addr, forwarder_config));
        Self {
            bind_addr,
            forwarder,
            request_timeout,
            client_idle_timeout: DEFAULT_CLIENT_IDLE_TIMEOUT,
            shutdown_rx,
        }
    }

    /// Bound how long a client may idle while sending request headers.
    /// Partial requests are closed once this elapses.
    pub fn with_client_idle_timeout(mut self, timeout: Duration) -> Self {
        self.client_idle_timeout = timeout;
        self
    }

    /// Get the forwarder (for statistics)
    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(
            addr = %self.bind_addr,
            upstream = %self.forwarder.upstream_addr(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let request_timeout = self.request_timeout;
        let client_idle_timeout = self.client_idle_timeout;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let forwarder = Arc::clone(&self.forwarder);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, forwarder, request_timeout, client_idle_timeout).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender also means shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
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
    addr: SocketAddr,
    forwarder: Arc<Forwarder>,
    request_timeout: Duration,
    client_idle_timeout: Duration,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let forwarder = Arc::clone(&forwarder);
        let client_addr = addr;
        async move { handle_request(req, forwarder, client_addr, request_timeout).await }
    });

    // Use auto::Builder to support both HTTP/1.1 and HTTP/2.
    // Requests hyper cannot parse are answered 400 at this layer and never
    // reach the upstream. The header read timeout bounds the client leg:
    // a client idling on a partial request is disconnected.
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(client_idle_timeout)
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    forwarder: Arc<Forwarder>,
    client_addr: SocketAddr,
    request_timeout: Duration,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    // Add proxy headers
    // Security: We overwrite X-Forwarded-* headers rather than appending to prevent
    // client spoofing. This proxy is assumed to be the first trusted hop.
    let headers = req.headers_mut();

    // Set X-Forwarded-For to the actual client IP (overwrites any client-provided value)
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    // Set X-Forwarded-Host (original Host header, overwrites any client-provided value)
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    // Set X-Forwarded-Proto (overwrites any client-provided value)
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %method, uri = %uri, client = %client_addr, "Incoming request");

    // Forward with a bounded timeout on the upstream leg; the timeout drops
    // the forward future, releasing the upstream connection.
    let result = tokio::time::timeout(request_timeout, forwarder.send_request(req)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(ForwardError::RequestBuild(e))) => {
            // Log detailed error internally, return generic message externally
            warn!(method = %method, uri = %uri, error = %e, "Failed to rebuild request for upstream");
            Ok(json_error_response(
                ProxyErrorCode::MalformedRequest,
                "Malformed request",
            ))
        }
        Ok(Err(ForwardError::Upstream(e))) => {
            error!(
                method = %method,
                uri = %uri,
                upstream = %forwarder.upstream_addr(),
                error = %e,
                "Failed to forward request to upstream"
            );
            Ok(json_error_response(
                ProxyErrorCode::UpstreamUnavailable,
                "Upstream unavailable",
            ))
        }
        Err(_) => {
            warn!(
                method = %method,
                uri = %uri,
                upstream = %forwarder.upstream_addr(),
                timeout_secs = request_timeout.as_secs(),
                "Upstream did not respond in time"
            );
            Ok(json_error_response(
                ProxyErrorCode::UpstreamTimeout,
                format!(
                    "Upstream did not respond within {} seconds",
                    request_timeout.as_secs()
                ),
            ))
        }
    }
}
