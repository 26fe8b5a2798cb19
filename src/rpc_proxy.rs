//! JSON-RPC proxy for `ethereum.node.<base>`.
//!
//! Lets pages served from `*.eth.<base>` talk to the Ethereum node behind
//! the name resolver without knowing where it runs. Requests are validated
//! as JSON-RPC 2.0 (single or batch) before they are forwarded.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hyper::header::{self, HeaderValue};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::name_resolver::NameResolver;
use crate::server::SubHandler;

/// Largest request body accepted
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
/// Server error range, used when the node cannot be reached
const UNAVAILABLE: i64 = -32000;

pub struct RpcProxy {
    upstream_url: String,
    resolver: Arc<dyn NameResolver>,
    http_client: reqwest::Client,
}

impl RpcProxy {
    pub fn new(
        upstream_url: &str,
        resolver: Arc<dyn NameResolver>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            upstream_url: upstream_url.to_string(),
            resolver,
            http_client,
        })
    }

    fn health(&self) -> Response<Body> {
        let ready = self.resolver.ready();
        let status = if ready {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        json_response(
            status,
            &json!({ "status": if ready { "ok" } else { "syncing" }, "ready": ready }),
        )
    }

    async fn relay(&self, req: Request<Body>) -> Response<Body> {
        let body = match read_body(req.into_body(), MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(status) => {
                return rpc_error(status, INVALID_REQUEST, "request body too large or unreadable")
            }
        };

        let payload: Value = match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(_) => return rpc_error(StatusCode::BAD_REQUEST, PARSE_ERROR, "parse error"),
        };
        if let Err(reason) = validate_payload(&payload) {
            return rpc_error(StatusCode::BAD_REQUEST, INVALID_REQUEST, reason);
        }

        if !self.resolver.ready() {
            return rpc_error(
                StatusCode::SERVICE_UNAVAILABLE,
                UNAVAILABLE,
                "ethereum node is not ready",
            );
        }

        let upstream = match self
            .http_client
            .post(&self.upstream_url)
            .header(header::CONTENT_TYPE.as_str(), "application/json")
            .body(body)
            .send()
            .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(upstream = %self.upstream_url, error = %e, "RPC upstream unreachable");
                return rpc_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    UNAVAILABLE,
                    "ethereum node unreachable",
                );
            }
        };

        let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        match upstream.bytes().await {
            Ok(bytes) => {
                let mut response = Response::new(Body::from(bytes));
                *response.status_mut() = status;
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            }
            Err(e) => {
                warn!(error = %e, "RPC upstream response failed");
                rpc_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    UNAVAILABLE,
                    "ethereum node response failed",
                )
            }
        }
    }
}

#[async_trait]
impl SubHandler for RpcProxy {
    fn name(&self) -> &'static str {
        "rpc"
    }

    async fn handle(&self, req: Request<Body>, _remote_addr: SocketAddr) -> Response<Body> {
        let start_time = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let mut response = match (&method, path.as_str()) {
            (&Method::GET, "/health") => self.health(),
            (&Method::POST, "/") => self.relay(req).await,
            (&Method::OPTIONS, _) => {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::NO_CONTENT;
                response
            }
            (_, "/") => rpc_error(StatusCode::METHOD_NOT_ALLOWED, INVALID_REQUEST, "use POST"),
            _ => rpc_error(StatusCode::NOT_FOUND, INVALID_REQUEST, "not found"),
        };
        allow_cors(&mut response);

        info!(
            "{} {} {} {}ms",
            method,
            path,
            response.status().as_u16(),
            start_time.elapsed().as_millis()
        );
        response
    }
}

/// Check a single request or a batch against JSON-RPC 2.0
pub fn validate_payload(payload: &Value) -> Result<(), &'static str> {
    match payload {
        Value::Array(batch) if batch.is_empty() => Err("empty batch"),
        Value::Array(batch) => batch.iter().try_for_each(validate_request),
        single => validate_request(single),
    }
}

fn validate_request(request: &Value) -> Result<(), &'static str> {
    let Value::Object(fields) = request else {
        return Err("request must be an object");
    };
    if fields.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err("jsonrpc must be \"2.0\"");
    }
    match fields.get("method") {
        Some(Value::String(method)) if !method.is_empty() => {}
        _ => return Err("method must be a non-empty string"),
    }
    match fields.get("params") {
        None | Some(Value::Array(_)) | Some(Value::Object(_)) => {}
        _ => return Err("params must be an array or object"),
    }
    match fields.get("id") {
        None | Some(Value::Null) | Some(Value::String(_)) | Some(Value::Number(_)) => Ok(()),
        _ => Err("id must be a string, number or null"),
    }
}

/// Read at most `limit` bytes of `body`
async fn read_body(mut body: Body, limit: usize) -> Result<Vec<u8>, StatusCode> {
    use futures::StreamExt;

    let mut buf = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|_| StatusCode::BAD_REQUEST)?;
        if buf.len() + chunk.len() > limit {
            return Err(StatusCode::PAYLOAD_TOO_LARGE);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn json_response(status: StatusCode, value: &Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn rpc_error(status: StatusCode, code: i64, message: &str) -> Response<Body> {
    json_response(
        status,
        &json!({
            "jsonrpc": "2.0",
            "error": { "code": code, "message": message },
            "id": Value::Null,
        }),
    )
}

fn allow_cors(response: &mut Response<Body>) {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, GET, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type"),
    );
}
