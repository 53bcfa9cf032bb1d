//! The hello-world upstream server
//!
//! Answers exactly one route, `GET /`, with a fixed JSON greeting. Binds a
//! loopback address only; the proxy is the sole way to reach it. A failed
//! bind is fatal - the process exits non-zero and nothing retries.

use crate::error::{json_error_response, ProxyErrorCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// The upstream application server
pub struct UpstreamServer {
    bind_addr: SocketAddr,
    greeting: Arc<String>,
    shutdown_rx: watch::Receiver<bool>,
    test_routes: bool,
}

impl UpstreamServer {
    pub fn new(bind_addr: SocketAddr, greeting: String, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            greeting: Arc::new(greeting),
            shutdown_rx,
            test_routes: false,
        }
    }

    /// Enable the /headers and /echo routes used by the test suite.
    /// The shipped binary never turns these on.
    pub fn with_test_routes(mut self) -> Self {
        self.test_routes = true;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            error!(addr = %self.bind_addr, error = %e, "Failed to bind upstream listener");
            anyhow::anyhow!("Failed to bind upstream listener on {}: {}", self.bind_addr, e)
        })?;
        info!(addr = %self.bind_addr, "Upstream server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let test_routes = self.test_routes;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let greeting = Arc::clone(&self.greeting);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let greeting = Arc::clone(&greeting);
                                    async move { handle_request(req, greeting, test_routes).await }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Upstream connection error");
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
                        info!("Upstream server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    greeting: Arc<String>,
    test_routes: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(method = %method, path = %path, "Upstream request");

    match (&method, path.as_str()) {
        (&Method::GET, "/") => Ok(greeting_response(&greeting)),
        (&Method::GET, "/headers") if test_routes => Ok(headers_response(&req)),
        (&Method::POST, "/echo") if test_routes => Ok(echo_response(req)),
        _ => Ok(json_error_response(
            ProxyErrorCode::NotFound,
            format!("No route for {} {}", method, path),
        )),
    }
}

/// Build the one real response: 200 with the fixed JSON greeting
fn greeting_response(greeting: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::json!({ "message": greeting }).to_string();

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Echo received request headers as a JSON object (test route)
fn headers_response(req: &Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut headers = serde_json::Map::new();
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(
                name.as_str().to_lowercase(),
                serde_json::Value::String(v.to_string()),
            );
        }
    }
    let body = serde_json::Value::Object(headers).to_string();

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Stream the request body straight back (test route)
fn echo_response(req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let content_type = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| hyper::header::HeaderValue::from_static("application/octet-stream"));

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .body(req.into_body().boxed())
        .expect("valid response builder")
}
