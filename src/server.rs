//! HTTPS listener and Host-based dispatch.
//!
//! One TLS listener serves every route. After the handshake the request's
//! Host header picks a sub-handler:
//! - `ethereum.node.<base>` and below go to the RPC proxy
//! - `node.<base>` and below go to the cache admin API
//! - `*.eth.<base>` goes to the content proxy
//!
//! Anything else gets a 404 page.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response, StatusCode};
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::content_proxy::error_page;
use crate::domain::{matches_suffix, normalize_host, HostSuffixes};

/// Maximum concurrent TLS connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Connection timeout for TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A request handler mounted under one host suffix
#[async_trait]
pub trait SubHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce a terminal response; errors are rendered by the handler itself
    async fn handle(&self, req: Request<Body>, remote_addr: SocketAddr) -> Response<Body>;
}

/// Which sub-handler a host belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Rpc,
    Admin,
    Content,
    NotFound,
}

/// Pick the route for a raw Host value
pub fn route(host: Option<&str>, suffixes: &HostSuffixes) -> Route {
    let Some(host) = host.and_then(normalize_host) else {
        return Route::NotFound;
    };

    // rpc lives under node, so it must be checked first
    if matches_suffix(&host, &suffixes.rpc) {
        Route::Rpc
    } else if matches_suffix(&host, &suffixes.node) {
        Route::Admin
    } else if host != suffixes.ens && matches_suffix(&host, &suffixes.ens) {
        Route::Content
    } else {
        Route::NotFound
    }
}

/// Host of a request: the Host header, or the URI authority for absolute-form targets
fn request_host(req: &Request<Body>) -> Option<&str> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
}

/// Dispatches requests to sub-handlers by Host
pub struct HostRouter {
    suffixes: HostSuffixes,
    rpc: Arc<dyn SubHandler>,
    admin: Arc<dyn SubHandler>,
    content: Arc<dyn SubHandler>,
}

impl HostRouter {
    pub fn new(
        suffixes: HostSuffixes,
        rpc: Arc<dyn SubHandler>,
        admin: Arc<dyn SubHandler>,
        content: Arc<dyn SubHandler>,
    ) -> Self {
        Self {
            suffixes,
            rpc,
            admin,
            content,
        }
    }

    pub fn suffixes(&self) -> &HostSuffixes {
        &self.suffixes
    }

    pub async fn handle(&self, req: Request<Body>, remote_addr: SocketAddr) -> Response<Body> {
        let handler = match route(request_host(&req), &self.suffixes) {
            Route::Rpc => &self.rpc,
            Route::Admin => &self.admin,
            Route::Content => &self.content,
            Route::NotFound => {
                debug!(
                    host = request_host(&req).unwrap_or("-"),
                    path = req.uri().path(),
                    "No route for host"
                );
                return error_page(
                    StatusCode::NOT_FOUND,
                    "Not Found",
                    "This host is not served by the gateway.",
                );
            }
        };
        handler.handle(req, remote_addr).await
    }
}

/// Listener settings
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen: SocketAddr,
    pub max_connections: usize,
    pub handshake_timeout: Duration,
}

impl ServerOptions {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// The single HTTPS listener
pub struct HttpsServer {
    options: ServerOptions,
    tls_config: Arc<ServerConfig>,
    router: Arc<HostRouter>,
    connection_semaphore: Arc<Semaphore>,
}

impl HttpsServer {
    pub fn new(options: ServerOptions, tls_config: ServerConfig, router: Arc<HostRouter>) -> Self {
        let connection_semaphore = Arc::new(Semaphore::new(options.max_connections));
        Self {
            options,
            tls_config: Arc::new(tls_config),
            router,
            connection_semaphore,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.options.listen
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.options.listen)
            .await
            .with_context(|| format!("Failed to bind to {}", self.options.listen))
    }

    /// Bind and serve until `shutdown` flips to true
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let acceptor = TlsAcceptor::from(self.tls_config.clone());
        let local_addr = listener.local_addr()?;

        info!("HTTPS gateway listening on {}", local_addr);

        loop {
            let (stream, client_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Failed to accept TCP connection: {}", e);
                        continue;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("HTTPS gateway on {} shutting down", local_addr);
                        return Ok(());
                    }
                    continue;
                }
            };

            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Max connections reached, rejecting connection from {}", client_addr);
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let router = self.router.clone();
            let handshake_timeout = self.options.handshake_timeout;

            tokio::spawn(async move {
                let _permit = permit;

                let tls_stream = match timeout(handshake_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        debug!("TLS handshake failed for {}: {}", client_addr, e);
                        return;
                    }
                    Err(_) => {
                        debug!("TLS handshake timeout for {}", client_addr);
                        return;
                    }
                };

                let service = service_fn(move |req: Request<Body>| {
                    let router = router.clone();
                    async move { Ok::<_, Infallible>(router.handle(req, client_addr).await) }
                });

                if let Err(e) = Http::new()
                    .http1_only(true)
                    .serve_connection(tls_stream, service)
                    .await
                {
                    debug!("Connection error from {}: {}", client_addr, e);
                }
            });
        }
    }
}
