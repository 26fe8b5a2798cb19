use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::content_proxy::DEFAULT_TARGET_CACHE_SIZE;
use crate::content_store::DEFAULT_KUBO_API;
use crate::reconciler::{DEFAULT_MAX_SEEDED, DEFAULT_SEED_INTERVAL};
use crate::resolution_cache::{DEFAULT_MEMORY_ENTRIES, DEFAULT_MEMORY_TTL, DEFAULT_RESOLVE_TIMEOUT};
use crate::server::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS};

/// Overrides `server.base_domain`
pub const ENV_BASE_DOMAIN: &str = "ETHLINK_BASE_DOMAIN";
/// Overrides `server.host` and `server.port` with one `host:port` value
pub const ENV_LISTEN: &str = "ETHLINK_LISTEN";

/// Node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub cache: CacheConfig,
    pub resolver: ResolverConfig,
    pub content_store: ContentStoreConfig,
    pub rpc: RpcConfig,
    pub seeding: SeedingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Domain every served host lives under (`vitalik.eth.<base_domain>`)
    pub base_domain: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Directory holding the CA hierarchy, server key and leaves
    pub cert_dir: PathBuf,
    /// Delete the root key once the intermediate exists
    pub hardened_root_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding durable resolution records
    pub dir: PathBuf,
    pub memory_ttl_secs: u64,
    /// Names kept in the memory tier
    pub memory_entries: usize,
    pub resolve_timeout_secs: u64,
    /// Gateway targets kept per content identifier
    pub target_cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// DNSLink gateway suffix; empty queries `_dnslink.<name>` directly
    pub dnslink_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentStoreConfig {
    /// Kubo RPC API endpoint
    pub api_url: String,
    /// Host of the subdomain gateway (`<cid>.ipfs.<gateway_host>`)
    pub gateway_host: String,
    pub gateway_port: u16,
    pub request_timeout_secs: u64,
    pub pin_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Ethereum JSON-RPC endpoint requests are relayed to
    pub upstream_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedingConfig {
    pub interval_secs: u64,
    pub max_seeded: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 443,
            base_domain: "localhost".to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_dir: PathBuf::from("data/certs"),
            hardened_root_key: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/cache"),
            memory_ttl_secs: DEFAULT_MEMORY_TTL.as_secs(),
            memory_entries: DEFAULT_MEMORY_ENTRIES,
            resolve_timeout_secs: DEFAULT_RESOLVE_TIMEOUT.as_secs(),
            target_cache_size: DEFAULT_TARGET_CACHE_SIZE,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            dnslink_suffix: "eth.limo".to_string(),
        }
    }
}

impl Default for ContentStoreConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_KUBO_API.to_string(),
            gateway_host: "localhost".to_string(),
            gateway_port: 8080,
            request_timeout_secs: 30,
            pin_timeout_secs: 600,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            upstream_url: "http://127.0.0.1:8545".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for SeedingConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SEED_INTERVAL.as_secs(),
            max_seeded: DEFAULT_MAX_SEEDED,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address {}: {}", addr, e))
    }
}

impl CacheConfig {
    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(&self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `ETHLINK_*` environment overrides
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(
            std::env::var(ENV_BASE_DOMAIN).ok(),
            std::env::var(ENV_LISTEN).ok(),
        )
    }

    fn apply_overrides(
        &mut self,
        base_domain: Option<String>,
        listen: Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(base_domain) = base_domain {
            self.server.base_domain = base_domain;
        }
        if let Some(listen) = listen {
            let addr: SocketAddr = listen
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {} value {}: {}", ENV_LISTEN, listen, e))?;
            self.server.host = addr.ip().to_string();
            self.server.port = addr.port();
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server.listen_addr()?;

        if self.server.port == 0 {
            anyhow::bail!("Invalid port: cannot be 0");
        }

        if self.server.max_connections == 0 {
            anyhow::bail!("Invalid max_connections: must be > 0");
        }

        let base = self.server.base_domain.trim_matches('.');
        if base.is_empty() || base.contains(['/', ':', ' ', '*']) {
            anyhow::bail!("Invalid base_domain: {:?}", self.server.base_domain);
        }

        if self.cache.target_cache_size == 0 {
            anyhow::bail!("Invalid cache target_cache_size: must be > 0");
        }

        if self.cache.memory_entries == 0 {
            anyhow::bail!("Invalid cache memory_entries: must be > 0");
        }

        if self.cache.resolve_timeout_secs == 0 {
            anyhow::bail!("Invalid cache resolve_timeout_secs: must be > 0");
        }

        url::Url::parse(&self.content_store.api_url)
            .map_err(|e| anyhow::anyhow!("Invalid content_store api_url: {}", e))?;
        url::Url::parse(&self.rpc.upstream_url)
            .map_err(|e| anyhow::anyhow!("Invalid rpc upstream_url: {}", e))?;

        if self.seeding.interval_secs == 0 {
            anyhow::bail!("Invalid seeding interval_secs: must be > 0");
        }

        Ok(())
    }
}
