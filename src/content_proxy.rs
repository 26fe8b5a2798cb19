//! Content proxy for `*.eth.<base>` hosts.
//!
//! Resolves the ENS name in the Host header and forwards the request to the
//! content-store gateway's subdomain for the resolved identifier
//! (`http://<cid>.ipfs.localhost:<port>`), streaming bodies both ways.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Body, Request, Response, StatusCode, Uri};
use lru::LruCache;
use tracing::{debug, error, info, warn};

use crate::content_id::ContentId;
use crate::content_store::ContentStore;
use crate::domain::ens_name_from_host;
use crate::error::{GatewayError, ResolutionError};
use crate::gateway_client::GatewayClient;
use crate::lock_utils::lock_or_recover;
use crate::resolution_cache::ResolutionCache;
use crate::server::SubHandler;

/// Headers that describe one connection and must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub const DEFAULT_TARGET_CACHE_SIZE: usize = 256;

/// Where a content identifier is served by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    /// `http://<cid>.ipfs.<gateway_host>:<port>`
    pub origin: String,
    pub host: HeaderValue,
}

/// Gateway location settings
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Host under which the gateway serves `<cid>.ipfs.<host>` subdomains
    pub host: String,
    pub port: u16,
    /// Deadline for the gateway's response headers
    pub request_timeout: Duration,
}

pub struct ContentProxy {
    base_domain: String,
    cache: Arc<ResolutionCache>,
    store: Arc<dyn ContentStore>,
    client: GatewayClient,
    gateway: GatewayOptions,
    targets: Mutex<LruCache<ContentId, ProxyTarget>>,
}

impl ContentProxy {
    pub fn new(
        base_domain: &str,
        cache: Arc<ResolutionCache>,
        store: Arc<dyn ContentStore>,
        client: GatewayClient,
        gateway: GatewayOptions,
        target_cache_size: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(target_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            base_domain: base_domain.to_string(),
            cache,
            store,
            client,
            gateway,
            targets: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Gateway target for `cid`, built once per identifier
    pub fn target(&self, cid: &ContentId) -> Result<ProxyTarget, GatewayError> {
        let mut targets = lock_or_recover(&self.targets, "proxy targets");
        if let Some(target) = targets.get(cid) {
            return Ok(target.clone());
        }

        let authority = format!(
            "{}.ipfs.{}:{}",
            cid.subdomain_label(),
            self.gateway.host,
            self.gateway.port
        );
        let host = HeaderValue::from_str(&authority)
            .map_err(|e| GatewayError::Proxy(format!("invalid gateway host {}: {}", authority, e)))?;
        let target = ProxyTarget {
            origin: format!("http://{}", authority),
            host,
        };
        targets.put(*cid, target.clone());
        Ok(target)
    }

    pub fn cached_targets(&self) -> usize {
        lock_or_recover(&self.targets, "proxy targets").len()
    }

    /// Record the identifier and copy it into the cache, off the request path
    fn spawn_side_effects(&self, name: &str, cid: ContentId) {
        let cache = Arc::clone(&self.cache);
        let store = Arc::clone(&self.store);
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = cache.save(&name, &cid).await {
                warn!(domain = %name, error = %e, "Failed to persist resolution");
            }
            if let Err(e) = store.copy_to_cache(&cid).await {
                warn!(domain = %name, cid = %cid, error = %e, "Failed to copy content to cache");
            }
        });
    }

    async fn forward(
        &self,
        req: Request<Body>,
        cid: &ContentId,
        remote_addr: SocketAddr,
    ) -> Result<Response<Body>, GatewayError> {
        let target = self.target(cid)?;
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("{}{}", target.origin, path_and_query)
            .parse()
            .map_err(|e| GatewayError::BadRequest(format!("invalid path: {}", e)))?;

        let (mut parts, body) = req.into_parts();
        let original_host = parts.headers.get(header::HOST).cloned();
        parts.uri = uri;
        strip_hop_by_hop(&mut parts.headers);
        parts.headers.insert(header::HOST, target.host.clone());
        parts.headers.remove("x-forwarded-for");
        if let Ok(client_ip) = HeaderValue::from_str(&remote_addr.ip().to_string()) {
            parts.headers.insert("x-forwarded-for", client_ip);
        }
        parts
            .headers
            .insert("x-forwarded-proto", HeaderValue::from_static("https"));
        if let Some(host) = original_host {
            parts.headers.insert("x-forwarded-host", host);
        }

        let pending = self.client.request(Request::from_parts(parts, body));
        let mut response = tokio::time::timeout(self.gateway.request_timeout, pending)
            .await
            .map_err(|_| {
                GatewayError::Proxy(format!(
                    "gateway did not answer within {}ms",
                    self.gateway.request_timeout.as_millis()
                ))
            })?
            .map_err(|e| GatewayError::Proxy(format!("gateway unreachable: {}", e)))?;

        strip_hop_by_hop(response.headers_mut());
        if is_html(response.headers()) {
            force_revalidation(response.headers_mut());
        }
        Ok(response)
    }
}

#[async_trait]
impl SubHandler for ContentProxy {
    fn name(&self) -> &'static str {
        "content"
    }

    async fn handle(&self, req: Request<Body>, remote_addr: SocketAddr) -> Response<Body> {
        let start_time = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().host())
            .unwrap_or_default()
            .to_string();

        let response = match ens_name_from_host(&host, &self.base_domain) {
            None => error_page(
                StatusCode::NOT_FOUND,
                "Not found",
                &format!("{} is not an ENS name", host),
            ),
            Some(name) => match self.cache.resolve(&name).await {
                Err(e) => resolution_failure_page(&name, &e),
                Ok(cid) => {
                    debug!(domain = %name, cid = %cid, "Resolved");
                    self.spawn_side_effects(&name, cid);
                    match self.forward(req, &cid, remote_addr).await {
                        Ok(response) => response,
                        Err(e) => {
                            error!(domain = %name, cid = %cid, error = %e, "Proxy failure");
                            error_page(
                                e.status_code(),
                                "Gateway error",
                                &format!("Could not load {} ({}): {}", name, cid, e),
                            )
                        }
                    }
                }
            },
        };

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

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by Connection are hop-by-hop as well
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    for name in listed.iter().map(String::as_str).chain(HOP_BY_HOP.iter().copied()) {
        headers.remove(name);
    }
}

fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false)
}

/// Drop validators and lifetimes so browsers revalidate pages
fn force_revalidation(headers: &mut HeaderMap) {
    for name in [
        header::CACHE_CONTROL,
        header::EXPIRES,
        header::ETAG,
        header::LAST_MODIFIED,
    ] {
        headers.remove(name);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
}

fn resolution_failure_page(name: &str, err: &ResolutionError) -> Response<Body> {
    let detail = match err {
        ResolutionError::NoResolver(_) => {
            format!("{} does not exist or has no resolver set.", name)
        }
        ResolutionError::NoContentHash(_) => {
            format!("{} has no content hash set, so there is nothing to show.", name)
        }
        other => format!("{} could not be resolved: {}", name, other),
    };
    error_page(StatusCode::NOT_FOUND, "Name not resolved", &detail)
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Small HTML diagnostic page
pub fn error_page(status: StatusCode, title: &str, detail: &str) -> Response<Body> {
    let html = format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{code} {title}</h1><p>{detail}</p></body></html>\n",
        title = escape_html(title),
        code = status.as_u16(),
        detail = escape_html(detail),
    );
    let mut response = Response::new(Body::from(html));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::test_support::cid_for;
    use crate::content_store::test_support::MemoryContentStore;
    use crate::gateway_client::gateway_client;
    use crate::resolution_cache::test_support::StaticResolver;
    use crate::resolution_cache::DurableCache;
    use tempfile::TempDir;

    fn proxy(dir: &TempDir, resolver: Arc<StaticResolver>, port: u16) -> ContentProxy {
        let cache = Arc::new(ResolutionCache::new(
            resolver,
            DurableCache::new(dir.path()),
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));
        ContentProxy::new(
            "localhost",
            cache,
            Arc::new(MemoryContentStore::default()),
            gateway_client(Duration::from_secs(1)),
            GatewayOptions {
                host: "localhost".to_string(),
                port,
                request_timeout: Duration::from_millis(300),
            },
            2,
        )
    }

    fn request(host: &str) -> Request<Body> {
        Request::builder()
            .uri("/index.html")
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_strip_hop_by_hop_includes_connection_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-custom"));
        headers.insert("x-custom", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn test_html_responses_are_revalidated() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        headers.insert(header::ETAG, HeaderValue::from_static("\"abc\""));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=29030400, immutable"));
        assert!(is_html(&headers));

        force_revalidation(&mut headers);
        assert!(!headers.contains_key(header::ETAG));
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    }

    #[test]
    fn test_assets_are_not_html() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
        assert!(!is_html(&headers));
    }

    #[test]
    fn test_error_page_escapes_detail() {
        let response = error_page(StatusCode::NOT_FOUND, "Oops", "<script>");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html; charset=utf-8");
    }

    #[tokio::test]
    async fn test_targets_are_cached_per_identifier() {
        let dir = TempDir::new().unwrap();
        let proxy = proxy(&dir, Arc::new(StaticResolver::default()), 8080);
        let cid = cid_for(b"site");

        let target = proxy.target(&cid).unwrap();
        assert_eq!(target.origin, format!("http://{}.ipfs.localhost:8080", cid));
        assert_eq!(proxy.target(&cid).unwrap(), target);
        assert_eq!(proxy.cached_targets(), 1);

        proxy.target(&cid_for(b"b")).unwrap();
        proxy.target(&cid_for(b"c")).unwrap();
        assert_eq!(proxy.cached_targets(), 2);
    }

    #[tokio::test]
    async fn test_missing_content_hash_is_404() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(StaticResolver::default());
        resolver.set_err("a.eth", ResolutionError::NoContentHash("a.eth".to_string()));
        let proxy = proxy(&dir, resolver, 8080);

        let response = proxy
            .handle(request("a.eth.localhost"), SocketAddr::from(([127, 0, 0, 1], 1)))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("no content hash"));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_500() {
        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(StaticResolver::default());
        resolver.set("a.eth", cid_for(b"site"));
        // Nothing listens on port 1
        let proxy = proxy(&dir, resolver, 1);

        let response = proxy
            .handle(request("a.eth.localhost"), SocketAddr::from(([127, 0, 0, 1], 1)))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_silent_gateway_is_500() {
        // Accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let dir = TempDir::new().unwrap();
        let resolver = Arc::new(StaticResolver::default());
        resolver.set("a.eth", cid_for(b"site"));
        let proxy = proxy(&dir, resolver, port);

        let response = tokio::time::timeout(
            Duration::from_secs(3),
            proxy.handle(request("a.eth.localhost"), SocketAddr::from(([127, 0, 0, 1], 1))),
        )
        .await
        .expect("proxy must give up on a silent gateway");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
