//! Content-addressed storage collaborator.
//!
//! The gateway pins, copies and streams content through [`ContentStore`].
//! [`KuboContentStore`] talks to a local Kubo node over its HTTP RPC API
//! (`/api/v0/...`, every call a POST).
//!
//! ## Cache layout
//! Every resolved identifier is copied into the node's mutable file system
//! under `/ethlink-cache/<cid>`. MFS entries are never garbage collected,
//! so recently browsed sites stay available offline even when not pinned.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use hyper::body::Bytes;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::content_id::ContentId;
use crate::error::GatewayError;

/// MFS directory holding cached content
pub const CACHE_ROOT: &str = "/ethlink-cache";

/// Default Kubo RPC endpoint (local node)
pub const DEFAULT_KUBO_API: &str = "http://127.0.0.1:5001";

/// Timeout for quick RPC calls (stat, cp, rm)
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Pinning fetches the whole DAG and may take much longer
const DEFAULT_PIN_TIMEOUT: Duration = Duration::from_secs(600);

/// Body stream returned by [`ContentStore::stream`]
pub type ContentStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Size of a content DAG
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStat {
    /// Size of the whole DAG
    pub total_size: u64,
    /// Bytes of the DAG present in the local repo
    pub local_size: u64,
}

/// Usage of the local repo
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoStat {
    pub repo_size: u64,
    pub storage_max: u64,
}

/// Content-addressed storage node
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Copy `cid` into the durable cache location; a no-op when present
    async fn copy_to_cache(&self, cid: &ContentId) -> Result<(), GatewayError>;

    /// Remove `cid` from the durable cache location
    async fn remove_from_cache(&self, cid: &ContentId) -> Result<(), GatewayError>;

    async fn pin(&self, cid: &ContentId, recursive: bool) -> Result<(), GatewayError>;

    async fn unpin(&self, cid: &ContentId) -> Result<(), GatewayError>;

    async fn stat(&self, cid: &ContentId) -> Result<ContentStat, GatewayError>;

    /// Stream the file at `path` inside `cid` (`""` for the root)
    async fn stream(&self, cid: &ContentId, path: &str) -> Result<ContentStream, GatewayError>;

    async fn repo_stat(&self) -> Result<RepoStat, GatewayError>;
}

/// Kubo connection settings
#[derive(Debug, Clone)]
pub struct KuboOptions {
    pub api_url: String,
    pub request_timeout: Duration,
    pub pin_timeout: Duration,
}

impl Default for KuboOptions {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_KUBO_API.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            pin_timeout: DEFAULT_PIN_TIMEOUT,
        }
    }
}

/// [`ContentStore`] backed by the Kubo HTTP RPC API
pub struct KuboContentStore {
    api_url: String,
    http_client: reqwest::Client,
    request_timeout: Duration,
    pin_timeout: Duration,
}

/// Error body Kubo returns with non-2xx responses
#[derive(Debug, Deserialize)]
struct KuboError {
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Debug, Deserialize)]
struct FilesStat {
    #[serde(rename = "CumulativeSize", default)]
    cumulative_size: u64,
    #[serde(rename = "SizeLocal", default)]
    size_local: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RepoStatResponse {
    #[serde(rename = "RepoSize", default)]
    repo_size: u64,
    #[serde(rename = "StorageMax", default)]
    storage_max: u64,
}

impl KuboContentStore {
    pub fn new(options: KuboOptions) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            api_url: options.api_url.trim_end_matches('/').to_string(),
            http_client,
            request_timeout: options.request_timeout,
            pin_timeout: options.pin_timeout,
        })
    }

    /// MFS path of the cached copy of `cid`
    pub fn cache_path(cid: &ContentId) -> String {
        format!("{}/{}", CACHE_ROOT, cid)
    }

    async fn call(
        &self,
        command: &str,
        args: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}/api/v0/{}", self.api_url, command);
        let mut request = self.http_client.post(&url).query(args);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::ContentStore(format!("{} failed: {}", command, e)))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<KuboError>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        Err(GatewayError::ContentStore(format!(
            "{} returned {}: {}",
            command, status, message
        )))
    }

    async fn call_json<T: for<'de> Deserialize<'de>>(
        &self,
        command: &str,
        args: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        self.call(command, args, Some(self.request_timeout))
            .await?
            .json::<T>()
            .await
            .map_err(|e| GatewayError::ContentStore(format!("{} returned invalid JSON: {}", command, e)))
    }

    async fn is_cached(&self, cid: &ContentId) -> bool {
        self.call(
            "files/stat",
            &[("arg", Self::cache_path(cid))],
            Some(self.request_timeout),
        )
        .await
        .is_ok()
    }
}

#[async_trait]
impl ContentStore for KuboContentStore {
    async fn copy_to_cache(&self, cid: &ContentId) -> Result<(), GatewayError> {
        if self.is_cached(cid).await {
            debug!("{} already in {}", cid, CACHE_ROOT);
            return Ok(());
        }

        self.call(
            "files/mkdir",
            &[("arg", CACHE_ROOT.to_string()), ("parents", "true".to_string())],
            Some(self.request_timeout),
        )
        .await?;

        // cp resolves the DAG root, which may need a network fetch
        self.call(
            "files/cp",
            &[("arg", cid.ipfs_path()), ("arg", Self::cache_path(cid))],
            Some(self.pin_timeout),
        )
        .await?;

        info!("Copied {} to {}", cid, Self::cache_path(cid));
        Ok(())
    }

    async fn remove_from_cache(&self, cid: &ContentId) -> Result<(), GatewayError> {
        self.call(
            "files/rm",
            &[("arg", Self::cache_path(cid)), ("recursive", "true".to_string())],
            Some(self.request_timeout),
        )
        .await?;
        debug!("Removed {} from {}", cid, CACHE_ROOT);
        Ok(())
    }

    async fn pin(&self, cid: &ContentId, recursive: bool) -> Result<(), GatewayError> {
        self.call(
            "pin/add",
            &[("arg", cid.to_string()), ("recursive", recursive.to_string())],
            Some(self.pin_timeout),
        )
        .await?;
        info!("Pinned {} (recursive: {})", cid, recursive);
        Ok(())
    }

    async fn unpin(&self, cid: &ContentId) -> Result<(), GatewayError> {
        match self
            .call("pin/rm", &[("arg", cid.to_string())], Some(self.request_timeout))
            .await
        {
            Ok(_) => {
                info!("Unpinned {}", cid);
                Ok(())
            }
            Err(GatewayError::ContentStore(msg)) if msg.contains("not pinned") => {
                debug!("{} was not pinned", cid);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn stat(&self, cid: &ContentId) -> Result<ContentStat, GatewayError> {
        let stat: FilesStat = self
            .call_json(
                "files/stat",
                &[("arg", cid.ipfs_path()), ("with-local", "true".to_string())],
            )
            .await?;
        Ok(ContentStat {
            total_size: stat.cumulative_size,
            local_size: stat.size_local.unwrap_or(0),
        })
    }

    async fn stream(&self, cid: &ContentId, path: &str) -> Result<ContentStream, GatewayError> {
        let target = match path.trim_matches('/') {
            "" => cid.ipfs_path(),
            rest => format!("{}/{}", cid.ipfs_path(), rest),
        };
        // The deadline also bounds reading the body
        let response = self
            .call("cat", &[("arg", target)], Some(self.request_timeout))
            .await?;

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(stream.boxed())
    }

    async fn repo_stat(&self) -> Result<RepoStat, GatewayError> {
        let stat: RepoStatResponse = self
            .call_json("repo/stat", &[("size-only", "true".to_string())])
            .await?;
        Ok(RepoStat {
            repo_size: stat.repo_size,
            storage_max: stat.storage_max,
        })
    }
}

/// Collect a [`ContentStream`] into memory, refusing bodies over `limit` bytes
pub async fn read_to_end(mut stream: ContentStream, limit: usize) -> Result<Vec<u8>, GatewayError> {
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| GatewayError::ContentStore(e.to_string()))?;
        if body.len() + chunk.len() > limit {
            warn!("Content exceeds {} bytes, aborting read", limit);
            return Err(GatewayError::ContentStore(format!(
                "content larger than {} bytes",
                limit
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
