/// Cache administration API for `node.<base>`
///
/// Endpoints used by the desktop shell to inspect and manage cached names:
/// - GET  /api/cached-domains
/// - GET  /api/domain-favicon?domain=
/// - GET  /api/domain-sizes?domain=
/// - POST /api/clear-cache?domain=
/// - POST /api/toggle-auto-seed?domain=&enable=
/// - GET  /api/total-storage
use crate::content_store::{read_to_end, ContentStore};
use crate::error::GatewayError;
use crate::reconciler::AutoSeeder;
use crate::resolution_cache::{validate_name, CachedDomain, ResolutionCache};
use crate::server::SubHandler;

use anyhow::Result;
use async_trait::async_trait;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Favicons larger than this are not served
const MAX_FAVICON_BYTES: usize = 1024 * 1024;

/// Standard API response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApiResponse {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            data: None,
        }
    }
}

fn query_params(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

/// Cache admin API handler
pub struct CacheAdminApi {
    cache: Arc<ResolutionCache>,
    store: Arc<dyn ContentStore>,
    seeder: Arc<AutoSeeder>,
}

impl CacheAdminApi {
    pub fn new(
        cache: Arc<ResolutionCache>,
        store: Arc<dyn ContentStore>,
        seeder: Arc<AutoSeeder>,
    ) -> Self {
        Self {
            cache,
            store,
            seeder,
        }
    }

    /// Handle HTTP requests
    pub async fn handle_request(&self, req: Request<Body>) -> Result<Response<Body>> {
        let path = req.uri().path().to_string();
        let params = query_params(req.uri().query().unwrap_or(""));
        let method = req.method().clone();

        debug!("Cache admin request: {} {}", method, path);

        match (method, path.as_str()) {
            (Method::GET, "/api/cached-domains") => self.handle_cached_domains().await,
            (Method::GET, "/api/domain-favicon") => {
                let domain = required_domain(&params)?;
                self.handle_favicon(&domain).await
            }
            (Method::GET, "/api/domain-sizes") => {
                let domain = required_domain(&params)?;
                self.handle_sizes(&domain).await
            }
            (Method::POST, "/api/clear-cache") => {
                let domain = required_domain(&params)?;
                self.handle_clear_cache(&domain).await
            }
            (Method::POST, "/api/toggle-auto-seed") => {
                let domain = required_domain(&params)?;
                let enable = match params.get("enable").map(String::as_str) {
                    Some("true") | Some("1") => true,
                    Some("false") | Some("0") => false,
                    _ => {
                        return Err(
                            GatewayError::BadRequest("enable must be true or false".into()).into(),
                        )
                    }
                };
                self.handle_toggle_auto_seed(&domain, enable).await
            }
            (Method::GET, "/api/total-storage") => self.handle_total_storage().await,
            _ => json_response(StatusCode::NOT_FOUND, &ApiResponse::error("Endpoint not found")),
        }
    }

    async fn handle_cached_domains(&self) -> Result<Response<Body>> {
        let domains: Vec<CachedDomain> = self.cache.durable().list().await?;
        ok(serde_json::to_value(&domains)?)
    }

    async fn latest(&self, domain: &str) -> Result<CachedDomain> {
        self.cache
            .durable()
            .latest(domain)
            .await?
            .ok_or_else(|| GatewayError::BadRequest(format!("{} is not cached", domain)).into())
    }

    async fn handle_favicon(&self, domain: &str) -> Result<Response<Body>> {
        let record = match self.latest(domain).await {
            Ok(record) => record,
            Err(_) => return not_found("Domain not cached"),
        };

        let icon = match self.store.stream(&record.cid, "favicon.ico").await {
            Ok(stream) => read_to_end(stream, MAX_FAVICON_BYTES).await,
            Err(e) => Err(e),
        };
        match icon {
            Ok(bytes) => Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "image/x-icon")
                .header("Cache-Control", "max-age=3600")
                .body(Body::from(bytes))?),
            Err(e) => {
                debug!("No favicon for {}: {}", domain, e);
                not_found("Favicon not found")
            }
        }
    }

    async fn handle_sizes(&self, domain: &str) -> Result<Response<Body>> {
        let record = self.latest(domain).await?;
        let stat = self.store.stat(&record.cid).await?;
        ok(serde_json::to_value(stat)?)
    }

    /// Forget everything about `domain`: durable records, memory entry,
    /// pin and cached copy. Store-side failures are logged only.
    async fn handle_clear_cache(&self, domain: &str) -> Result<Response<Body>> {
        if let Some(record) = self.cache.durable().latest(domain).await? {
            if let Err(e) = self.store.unpin(&record.cid).await {
                warn!(domain, cid = %record.cid, error = %e, "Failed to unpin while clearing");
            }
            if let Err(e) = self.store.remove_from_cache(&record.cid).await {
                warn!(domain, cid = %record.cid, error = %e, "Failed to remove cached copy");
            }
        }
        self.cache.durable().remove(domain).await?;
        self.cache.forget(domain);

        info!(domain, "Cleared cache");
        ok(serde_json::json!({ "domain": domain, "cleared": true }))
    }

    async fn handle_toggle_auto_seed(&self, domain: &str, enable: bool) -> Result<Response<Body>> {
        if enable {
            self.seeder.enable(domain).await?;
        } else {
            self.seeder.disable(domain).await?;
        }
        ok(serde_json::json!({ "domain": domain, "autoSeed": enable }))
    }

    async fn handle_total_storage(&self) -> Result<Response<Body>> {
        let stat = self.store.repo_stat().await?;
        ok(serde_json::to_value(stat)?)
    }
}

#[async_trait]
impl SubHandler for CacheAdminApi {
    fn name(&self) -> &'static str {
        "admin"
    }

    async fn handle(&self, req: Request<Body>, _remote_addr: SocketAddr) -> Response<Body> {
        let start_time = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let response = match self.handle_request(req).await {
            Ok(response) => response,
            Err(e) => error_response(&e),
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

fn required_domain(params: &HashMap<String, String>) -> Result<String> {
    let domain = params
        .get("domain")
        .map(|d| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("Domain is required".to_string()))?;
    validate_name(&domain).map_err(|_| GatewayError::BadRequest(format!("invalid domain {}", domain)))?;
    Ok(domain)
}

fn json_response(status: StatusCode, body: &ApiResponse) -> Result<Response<Body>> {
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_string(body)?))?)
}

fn ok(data: serde_json::Value) -> Result<Response<Body>> {
    json_response(StatusCode::OK, &ApiResponse::success(data))
}

fn not_found(message: &str) -> Result<Response<Body>> {
    json_response(StatusCode::NOT_FOUND, &ApiResponse::error(message))
}

fn error_response(err: &anyhow::Error) -> Response<Body> {
    let status = err
        .downcast_ref::<GatewayError>()
        .map(GatewayError::status_code)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Cache admin error: {:#}", err);
    }
    let body = serde_json::to_string(&ApiResponse::error(&err.to_string()))
        .unwrap_or_else(|_| "{\"success\":false}".to_string());
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::test_support::cid_for;
    use crate::content_store::test_support::MemoryContentStore;
    use crate::resolution_cache::test_support::StaticResolver;
    use crate::resolution_cache::DurableCache;
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        cache: Arc<ResolutionCache>,
        store: Arc<MemoryContentStore>,
        api: CacheAdminApi,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ResolutionCache::new(
            Arc::new(StaticResolver::default()),
            DurableCache::new(dir.path()),
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));
        let store = Arc::new(MemoryContentStore::default());
        let seeder = Arc::new(AutoSeeder::new(cache.clone(), store.clone(), 10));
        let api = CacheAdminApi::new(cache.clone(), store.clone(), seeder);
        Fixture {
            _dir: dir,
            cache,
            store,
            api,
        }
    }

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn call(api: &CacheAdminApi, method: Method, uri: &str) -> (StatusCode, Value) {
        let response = api
            .handle(request(method, uri), SocketAddr::from(([127, 0, 0, 1], 1)))
            .await;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_cached_domains_lists_records() {
        let f = fixture();
        f.cache.save("a.eth", &cid_for(b"a")).await.unwrap();

        let (status, body) = call(&f.api, Method::GET, "/api/cached-domains").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["domain"], "a.eth");
        assert_eq!(body["data"][0]["cid"], cid_for(b"a").to_string());
        assert_eq!(body["data"][0]["autoSeed"], false);
    }

    #[tokio::test]
    async fn test_domain_is_required() {
        let f = fixture();
        let (status, body) = call(&f.api, Method::GET, "/api/domain-sizes").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = call(&f.api, Method::GET, "/api/domain-sizes?domain=..%2Fetc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_domain_sizes() {
        let f = fixture();
        f.cache.save("a.eth", &cid_for(b"a")).await.unwrap();

        let (status, body) = call(&f.api, Method::GET, "/api/domain-sizes?domain=a.eth").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["totalSize"], 2048);
        assert_eq!(body["data"]["localSize"], 1024);
    }

    #[tokio::test]
    async fn test_favicon_served_or_404() {
        let f = fixture();
        let cid = cid_for(b"a");
        f.cache.save("a.eth", &cid).await.unwrap();
        f.cache.save("b.eth", &cid_for(b"b")).await.unwrap();
        f.store.add_file(cid, "favicon.ico", b"icon");

        let response = f
            .api
            .handle(
                request(Method::GET, "/api/domain-favicon?domain=a.eth"),
                SocketAddr::from(([127, 0, 0, 1], 1)),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "image/x-icon");

        let (status, _) = call(&f.api, Method::GET, "/api/domain-favicon?domain=b.eth").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&f.api, Method::GET, "/api/domain-favicon?domain=c.eth").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_clear_cache_removes_everything() {
        let f = fixture();
        let cid = cid_for(b"a");
        f.cache.save("a.eth", &cid).await.unwrap();

        let (status, _) = call(&f.api, Method::POST, "/api/clear-cache?domain=a.eth").await;
        assert_eq!(status, StatusCode::OK);
        assert!(f.cache.durable().latest("a.eth").await.unwrap().is_none());
        assert_eq!(*f.store.unpins.lock().unwrap(), vec![cid]);
        assert_eq!(*f.store.removed.lock().unwrap(), vec![cid]);
    }

    #[tokio::test]
    async fn test_toggle_auto_seed() {
        let f = fixture();
        f.cache.save("a.eth", &cid_for(b"a")).await.unwrap();

        let (status, body) =
            call(&f.api, Method::POST, "/api/toggle-auto-seed?domain=a.eth&enable=true").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["autoSeed"], true);
        assert_eq!(f.store.pin_count(), 1);

        let (status, _) =
            call(&f.api, Method::POST, "/api/toggle-auto-seed?domain=a.eth&enable=false").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!f.cache.durable().latest("a.eth").await.unwrap().unwrap().auto_seed);

        let (status, _) =
            call(&f.api, Method::POST, "/api/toggle-auto-seed?domain=a.eth&enable=maybe").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_enable_without_cached_resolution_is_rejected() {
        let f = fixture();
        let (status, _) =
            call(&f.api, Method::POST, "/api/toggle-auto-seed?domain=new.eth&enable=true").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(f.store.pin_count(), 0);
    }

    #[tokio::test]
    async fn test_total_storage_and_unknown_route() {
        let f = fixture();
        let (status, body) = call(&f.api, Method::GET, "/api/total-storage").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["repoSize"], 4096);

        let (status, _) = call(&f.api, Method::GET, "/api/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&f.api, Method::GET, "/api/clear-cache?domain=a.eth").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
