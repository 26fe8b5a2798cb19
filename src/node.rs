//! Wiring of the node: certificate authority, collaborators, sub-handlers,
//! the HTTPS listener and the auto-seeder.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::ca::{CaOptions, CertificateAuthority};
use crate::cache_admin::CacheAdminApi;
use crate::config::Config;
use crate::content_proxy::{ContentProxy, GatewayOptions};
use crate::content_store::{ContentStore, KuboContentStore, KuboOptions};
use crate::gateway_client::gateway_client;
use crate::name_resolver::{DnsLinkResolver, NameResolver};
use crate::reconciler::AutoSeeder;
use crate::resolution_cache::{DurableCache, ResolutionCache};
use crate::rpc_proxy::RpcProxy;
use crate::server::{HostRouter, HttpsServer, ServerOptions};
use crate::sni::SniResolver;
use crate::trust_store::{SystemTrustStore, TrustStore};

const GATEWAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// External systems the node talks to
pub struct Collaborators {
    pub resolver: Arc<dyn NameResolver>,
    pub store: Arc<dyn ContentStore>,
    pub trust_store: Box<dyn TrustStore>,
}

impl Collaborators {
    /// DNSLink resolution, a local Kubo node and the platform trust store
    pub fn from_config(config: &Config) -> Result<Self> {
        let resolver = DnsLinkResolver::new(&config.resolver.dnslink_suffix)
            .context("Failed to create DNSLink resolver")?;
        let store = KuboContentStore::new(KuboOptions {
            api_url: config.content_store.api_url.clone(),
            request_timeout: Duration::from_secs(config.content_store.request_timeout_secs),
            pin_timeout: Duration::from_secs(config.content_store.pin_timeout_secs),
        })
        .context("Failed to create content store client")?;

        Ok(Self {
            resolver: Arc::new(resolver),
            store: Arc::new(store),
            trust_store: Box::new(SystemTrustStore),
        })
    }
}

pub fn ca_options(config: &Config) -> CaOptions {
    CaOptions {
        cert_dir: config.tls.cert_dir.clone(),
        base_domain: config.server.base_domain.clone(),
        hardened_root_key: config.tls.hardened_root_key,
    }
}

/// A fully wired gateway node
pub struct EthlinkNode {
    config: Config,
    authority: Arc<CertificateAuthority>,
    cache: Arc<ResolutionCache>,
    seeder: Arc<AutoSeeder>,
    server: HttpsServer,
}

impl EthlinkNode {
    pub fn build(config: Config) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Self::with_collaborators(config, collaborators)
    }

    pub fn with_collaborators(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            resolver,
            store,
            trust_store,
        } = collaborators;

        let authority = Arc::new(CertificateAuthority::initialize(
            &ca_options(&config),
            trust_store,
        )?);
        let suffixes = authority.suffixes().clone();

        let cache = Arc::new(ResolutionCache::new(
            Arc::clone(&resolver),
            DurableCache::new(&config.cache.dir),
            config.cache.memory_ttl(),
            config.cache.resolve_timeout(),
        )
        .with_memory_capacity(config.cache.memory_entries));
        let seeder = Arc::new(AutoSeeder::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            config.seeding.max_seeded,
        ));

        let content = ContentProxy::new(
            &suffixes.base,
            Arc::clone(&cache),
            Arc::clone(&store),
            gateway_client(GATEWAY_CONNECT_TIMEOUT),
            GatewayOptions {
                host: config.content_store.gateway_host.clone(),
                port: config.content_store.gateway_port,
                request_timeout: Duration::from_secs(config.content_store.request_timeout_secs),
            },
            config.cache.target_cache_size,
        );
        let rpc = RpcProxy::new(
            &config.rpc.upstream_url,
            Arc::clone(&resolver),
            Duration::from_secs(config.rpc.timeout_secs),
        )?;
        let admin = CacheAdminApi::new(Arc::clone(&cache), store, Arc::clone(&seeder));

        let router = Arc::new(HostRouter::new(
            suffixes,
            Arc::new(rpc),
            Arc::new(admin),
            Arc::new(content),
        ));

        let tls_config = Arc::new(SniResolver::new(Arc::clone(&authority))).server_config()?;
        let options = ServerOptions {
            listen: config.server.listen_addr()?,
            max_connections: config.server.max_connections,
            handshake_timeout: Duration::from_secs(config.server.handshake_timeout_secs),
        };
        let server = HttpsServer::new(options, tls_config, router);

        Ok(Self {
            config,
            authority,
            cache,
            seeder,
            server,
        })
    }

    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.authority
    }

    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.cache
    }

    pub fn seeder(&self) -> &Arc<AutoSeeder> {
        &self.seeder
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = self.server.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on `listener`, run the auto-seeder alongside, and clean up
    /// lazily issued certificates once `shutdown` flips to true
    pub async fn serve(&self, listener: TcpListener, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            base_domain = %self.config.server.base_domain,
            trusted = self.authority.is_trusted(),
            "Starting ethlink node"
        );

        let seeder = tokio::spawn(Arc::clone(&self.seeder).run(
            Duration::from_secs(self.config.seeding.interval_secs),
            shutdown.clone(),
        ));

        let served = self.server.serve(listener, shutdown).await;
        if served.is_err() {
            seeder.abort();
        }

        if let Err(e) = seeder.await {
            warn!("Auto-seeder task ended abnormally: {}", e);
        }
        if let Err(e) = self.authority.cleanup() {
            warn!("Failed to clean up generated certificates: {:#}", e);
        }
        served
    }
}
