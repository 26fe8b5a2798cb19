//! Shared fixtures for integration tests: in-memory collaborators, a fake
//! subdomain gateway, and a TLS client trusting the node's root.

#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use hyper::body::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, HeaderMap, Request, Response, Server, StatusCode};
use multihash::Multihash;
use rustls::pki_types::{CertificateDer, ServerName};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsConnector;

use ethlink_node::config::Config;
use ethlink_node::content_id::ContentId;
use ethlink_node::content_store::{ContentStat, ContentStore, ContentStream, RepoStat};
use ethlink_node::error::{GatewayError, ResolutionError};
use ethlink_node::name_resolver::NameResolver;
use ethlink_node::node::{Collaborators, EthlinkNode};
use ethlink_node::trust_store::{InstallOutcome, TrustStore};

pub fn cid_for(content: &[u8]) -> ContentId {
    let digest = Sha256::digest(content);
    let mh = Multihash::<64>::wrap(0x12, &digest).unwrap();
    ContentId::from_cid(Cid::new_v1(0x55, mh)).unwrap()
}

/// Resolver answering from a fixed table
#[derive(Default)]
pub struct TableResolver {
    pub answers: Mutex<HashMap<String, Result<ContentId, ResolutionError>>>,
    pub down: AtomicBool,
}

impl TableResolver {
    pub fn set(&self, name: &str, answer: Result<ContentId, ResolutionError>) {
        self.answers.lock().unwrap().insert(name.to_string(), answer);
    }
}

#[async_trait]
impl NameResolver for TableResolver {
    async fn resolve(&self, name: &str) -> Result<ContentId, ResolutionError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ResolutionError::Unavailable("offline".into()));
        }
        self.answers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_else(|| Err(ResolutionError::NoResolver(name.to_string())))
    }

    fn ready(&self) -> bool {
        true
    }

    async fn wait_ready(&self) {}
}

/// Content store recording pins and cache copies
#[derive(Default)]
pub struct RecordingStore {
    pub pins: Mutex<Vec<ContentId>>,
    pub copies: Mutex<Vec<ContentId>>,
}

#[async_trait]
impl ContentStore for RecordingStore {
    async fn copy_to_cache(&self, cid: &ContentId) -> Result<(), GatewayError> {
        self.copies.lock().unwrap().push(*cid);
        Ok(())
    }

    async fn remove_from_cache(&self, _cid: &ContentId) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn pin(&self, cid: &ContentId, _recursive: bool) -> Result<(), GatewayError> {
        self.pins.lock().unwrap().push(*cid);
        Ok(())
    }

    async fn unpin(&self, _cid: &ContentId) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn stat(&self, _cid: &ContentId) -> Result<ContentStat, GatewayError> {
        Ok(ContentStat {
            total_size: 100,
            local_size: 100,
        })
    }

    async fn stream(&self, _cid: &ContentId, path: &str) -> Result<ContentStream, GatewayError> {
        Err(GatewayError::ContentStore(format!("no link named {}", path)))
    }

    async fn repo_stat(&self) -> Result<RepoStat, GatewayError> {
        Ok(RepoStat {
            repo_size: 1,
            storage_max: 2,
        })
    }
}

pub struct NoopTrustStore;

impl TrustStore for NoopTrustStore {
    fn install(&self, _cert_path: &Path) -> anyhow::Result<InstallOutcome> {
        Ok(InstallOutcome::Manual {
            details: "test".into(),
        })
    }

    fn is_trusted(&self, _cert_path: &Path) -> bool {
        false
    }

    fn manual_install_instructions(&self, cert_path: &Path) -> String {
        cert_path.display().to_string()
    }
}

/// Subdomain gateway stand-in: `/` is HTML, anything else is JavaScript.
/// Every response carries caching headers and echoes the Host it saw.
pub async fn spawn_gateway() -> SocketAddr {
    let make_svc = make_service_fn(|_| async {
        Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
            let host = req
                .headers()
                .get(hyper::header::HOST)
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let (content_type, body) = if req.uri().path() == "/" {
                ("text/html; charset=utf-8", "<html>hello</html>")
            } else {
                ("application/javascript", "console.log(1)")
            };
            let response = Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", content_type)
                .header("Cache-Control", "public, max-age=29030400, immutable")
                .header("ETag", "\"abc\"")
                .header("X-Seen-Host", host)
                .body(Body::from(body))
                .unwrap();
            Ok::<_, Infallible>(response)
        }))
    });
    let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

/// A node serving on an ephemeral port with in-memory collaborators
pub struct TestNode {
    pub addr: SocketAddr,
    pub root: CertificateDer<'static>,
    pub node: Arc<EthlinkNode>,
    pub resolver: Arc<TableResolver>,
    pub store: Arc<RecordingStore>,
    pub shutdown: watch::Sender<bool>,
    pub dir: TempDir,
    pub served: tokio::task::JoinHandle<anyhow::Result<()>>,
}

pub async fn start_node(gateway: SocketAddr) -> TestNode {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.server.base_domain = "localhost".into();
    config.tls.cert_dir = dir.path().join("certs");
    config.cache.dir = dir.path().join("cache");
    config.content_store.gateway_host = "localhost".into();
    config.content_store.gateway_port = gateway.port();

    let resolver = Arc::new(TableResolver::default());
    let store = Arc::new(RecordingStore::default());
    let node = Arc::new(
        EthlinkNode::with_collaborators(
            config,
            Collaborators {
                resolver: resolver.clone(),
                store: store.clone(),
                trust_store: Box::new(NoopTrustStore),
            },
        )
        .unwrap(),
    );
    let root = node.authority().root_der().clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);
    let serving = node.clone();
    let served = tokio::spawn(async move { serving.serve(listener, rx).await });

    TestNode {
        addr,
        root,
        node,
        resolver,
        store,
        shutdown,
        dir,
        served,
    }
}

pub struct TlsResponse {
    pub chain_len: usize,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

fn connector(root: &CertificateDer<'static>) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(root.clone()).unwrap();
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Handshake with `server_name` as SNI, returning the presented chain length
pub async fn handshake(
    node: &TestNode,
    server_name: &str,
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(node.addr).await?;
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    tokio::time::timeout(Duration::from_secs(5), connector(&node.root).connect(name, tcp))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timeout"))?
}

/// One HTTPS request with `host` as both SNI and Host header
pub async fn https_request(
    node: &TestNode,
    method: &str,
    host: &str,
    path: &str,
    body: &str,
) -> TlsResponse {
    let tls = handshake(node, host).await.unwrap();
    let chain_len = tls
        .get_ref()
        .1
        .peer_certificates()
        .map(|c| c.len())
        .unwrap_or_default();

    let (mut sender, conn) = hyper::client::conn::handshake(tls).await.unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .method(method)
        .uri(path)
        .header("Host", host)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = sender.send_request(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();

    TlsResponse {
        chain_len,
        status,
        headers,
        body,
    }
}
