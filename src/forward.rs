//! Request forwarding to the upstream server
//!
//! This module owns the pooled HTTP client the proxy sends requests through.
//! Connections to the upstream are reused across requests; request and
//! response bodies stream through without being buffered wholesale.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for forwarding operations
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The upstream connection failed or was reset
    #[error("Upstream error: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
    /// The incoming request could not be rebuilt for the upstream
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

/// Counters for forwarded traffic
#[derive(Debug, Default)]
pub struct ForwardStats {
    /// Total number of requests forwarded
    pub total_requests: AtomicU64,
    /// Number of requests that failed on the upstream leg
    pub upstream_errors: AtomicU64,
}

impl ForwardStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_upstream_errors(&self) -> u64 {
        self.upstream_errors.load(Ordering::Relaxed)
    }
}

/// Configuration for the upstream connection pool
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Maximum idle connections kept to the upstream
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Forwards requests to a single fixed upstream address
pub struct Forwarder {
    client: Client<HttpConnector, Incoming>,
    upstream_addr: SocketAddr,
    stats: Arc<ForwardStats>,
    config: ForwarderConfig,
}

impl Forwarder {
    /// Create a forwarder for the given upstream address
    pub fn new(upstream_addr: SocketAddr, config: ForwarderConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            upstream = %upstream_addr,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Forwarder initialized"
        );

        Self {
            client,
            upstream_addr,
            stats: Arc::new(ForwardStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    pub fn upstream_addr(&self) -> SocketAddr {
        self.upstream_addr
    }

    /// Send a request to the upstream, streaming the body in both directions.
    ///
    /// Only the URI authority is rewritten; method, path, query, headers and
    /// body pass through unchanged.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let uri = format!(
            "http://{}{}",
            self.upstream_addr,
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        // Copy headers
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = self.client.request(upstream_req).await.map_err(|e| {
            self.stats.record_upstream_error();
            ForwardError::from(e)
        })?;

        // Hand the response body back as a stream
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}
