//! Outbound HTTP client for the content-store gateway.
//!
//! Subdomain gateways address content as `http://<cid>.ipfs.localhost:8080`.
//! `*.localhost` always means the loopback interface, but not every system
//! resolver knows that, so the client resolves those hosts itself and only
//! asks the system resolver about everything else.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::client::connect::dns::{GaiResolver, Name};
use hyper::client::HttpConnector;
use hyper::service::Service;
use hyper::{Body, Client};

/// HTTP client whose connections to `*.localhost` skip DNS
pub type GatewayClient = Client<HttpConnector<LoopbackResolver>, Body>;

/// `host` is `localhost` or a subdomain of it
pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim_end_matches('.');
    host.eq_ignore_ascii_case("localhost")
        || host
            .len()
            .checked_sub(".localhost".len())
            .and_then(|start| host.get(start..))
            .is_some_and(|tail| tail.eq_ignore_ascii_case(".localhost"))
}

/// Connection-resolution hook mapping `*.localhost` to 127.0.0.1
#[derive(Clone, Debug)]
pub struct LoopbackResolver {
    fallback: GaiResolver,
}

impl LoopbackResolver {
    pub fn new() -> Self {
        Self {
            fallback: GaiResolver::new(),
        }
    }
}

impl Default for LoopbackResolver {
    fn default() -> Self {
        Self::new()
    }
}

type Addrs = std::vec::IntoIter<SocketAddr>;

impl Service<Name> for LoopbackResolver {
    type Response = Addrs;
    type Error = std::io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Addrs, std::io::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.fallback.poll_ready(cx)
    }

    fn call(&mut self, name: Name) -> Self::Future {
        if is_loopback_host(name.as_str()) {
            // The connector fills in the port from the request URI
            let addrs = vec![SocketAddr::from((Ipv4Addr::LOCALHOST, 0))];
            return Box::pin(async move { Ok(addrs.into_iter()) });
        }

        let lookup = self.fallback.call(name);
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = lookup.await?.collect();
            Ok(addrs.into_iter())
        })
    }
}

/// Build the gateway client
pub fn gateway_client(connect_timeout: Duration) -> GatewayClient {
    let mut connector = HttpConnector::new_with_resolver(LoopbackResolver::new());
    connector.set_connect_timeout(Some(connect_timeout));
    connector.set_nodelay(true);
    Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .build(connector)
}
