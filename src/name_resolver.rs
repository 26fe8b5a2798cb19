//! Name-resolution collaborator.
//!
//! The gateway only needs `name -> content identifier` plus readiness from
//! whatever resolves names (an Ethereum light client, a remote resolver, a
//! DNS bridge). [`NameResolver`] is that seam. [`DnsLinkResolver`] is the
//! implementation shipped with the binary: it reads the `_dnslink` TXT
//! record that public ENS gateways publish for every name
//! (`_dnslink.vitalik.eth.limo`).

use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use tracing::{debug, warn};

use crate::content_id::ContentId;
use crate::error::ResolutionError;

/// Resolves ENS-style names to content identifiers
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Resolve `name` (e.g. `vitalik.eth`) to the content it points at
    async fn resolve(&self, name: &str) -> Result<ContentId, ResolutionError>;

    /// Whether the resolver can currently answer queries
    fn ready(&self) -> bool;

    /// Wait until [`NameResolver::ready`] would return true
    async fn wait_ready(&self);
}

/// Resolves names through DNSLink TXT records published under a DNS suffix
pub struct DnsLinkResolver {
    resolver: TokioResolver,
    suffix: String,
}

impl DnsLinkResolver {
    /// Create a resolver using the system DNS configuration.
    ///
    /// `suffix` is appended to each name (`eth.limo` turns `vitalik.eth`
    /// into `_dnslink.vitalik.eth.limo`); an empty suffix queries the name
    /// as is.
    pub fn new(suffix: &str) -> anyhow::Result<Self> {
        let resolver = TokioResolver::builder_tokio()
            .map_err(|e| anyhow::anyhow!("failed to create DNS resolver: {}", e))?
            .build();
        Ok(Self {
            resolver,
            suffix: suffix.trim_matches('.').to_string(),
        })
    }

    /// DNS name queried for `name`
    pub fn record_name(&self, name: &str) -> String {
        dnslink_record_name(name, &self.suffix)
    }
}

fn dnslink_record_name(name: &str, suffix: &str) -> String {
    let name = name.trim_matches('.');
    if suffix.is_empty() {
        format!("_dnslink.{}", name)
    } else if suffix.starts_with("eth.") && name.ends_with(".eth") {
        // vitalik.eth + eth.limo -> vitalik.eth.limo
        format!("_dnslink.{}{}", name, &suffix[3..])
    } else {
        format!("_dnslink.{}.{}", name, suffix)
    }
}

/// Extract the content identifier from DNSLink TXT strings.
///
/// Only `/ipfs/` values carry an immutable identifier; `/ipns/` records are
/// treated as having no content hash.
pub fn parse_dnslink<'a, I>(name: &str, records: I) -> Result<ContentId, ResolutionError>
where
    I: IntoIterator<Item = &'a str>,
{
    for record in records {
        let Some(value) = record.trim().strip_prefix("dnslink=") else {
            continue;
        };
        if !value.starts_with("/ipfs/") {
            debug!(name, value, "ignoring non-ipfs dnslink value");
            continue;
        }
        return value
            .parse::<ContentId>()
            .map_err(|_| ResolutionError::NoContentHash(name.to_string()));
    }
    Err(ResolutionError::NoContentHash(name.to_string()))
}

#[async_trait]
impl NameResolver for DnsLinkResolver {
    async fn resolve(&self, name: &str) -> Result<ContentId, ResolutionError> {
        let record_name = self.record_name(name);
        debug!(name, record = %record_name, "resolving dnslink");

        match self.resolver.txt_lookup(record_name.as_str()).await {
            Ok(lookup) => {
                let texts: Vec<String> = lookup
                    .iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|part| String::from_utf8_lossy(part).into_owned())
                            .collect::<String>()
                    })
                    .collect();
                parse_dnslink(name, texts.iter().map(String::as_str))
            }
            Err(e) if e.is_no_records_found() => Err(ResolutionError::NoResolver(name.to_string())),
            Err(e) => {
                warn!(name, error = %e, "dnslink lookup failed");
                Err(ResolutionError::Unavailable(e.to_string()))
            }
        }
    }

    fn ready(&self) -> bool {
        true
    }

    async fn wait_ready(&self) {}
}

/// Wait for `resolver` to become ready, giving up after `limit`
pub async fn wait_ready_for(resolver: &dyn NameResolver, limit: Duration) -> bool {
    if resolver.ready() {
        return true;
    }
    tokio::time::timeout(limit, resolver.wait_ready()).await.is_ok()
}
