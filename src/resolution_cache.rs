//! Two-tier cache of name resolutions.
//!
//! The memory tier absorbs repeated lookups for about one block interval.
//! The durable tier keeps every distinct identifier a name has resolved to,
//! one directory per name:
//!
//! ```text
//! <cache_dir>/vitalik.eth/1718000000000.cid
//! <cache_dir>/vitalik.eth/1718000600000.cid   latest version wins
//! <cache_dir>/vitalik.eth/auto-seed           present when auto-seeding
//! ```
//!
//! When the name resolver fails or times out, the latest durable record is
//! served instead, so sites stay browsable while the resolver is syncing.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use lru::LruCache;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::content_id::ContentId;
use crate::error::{GatewayError, ResolutionError};
use crate::lock_utils::lock_or_recover;
use crate::name_resolver::NameResolver;

/// Extension of durable version files
const VERSION_EXT: &str = "cid";

/// Marker file enabling auto-seeding for a name
const AUTO_SEED_MARKER: &str = "auto-seed";

/// Names held in the memory tier before the least recently used is evicted
pub const DEFAULT_MEMORY_ENTRIES: usize = 1024;

/// About one Ethereum block
pub const DEFAULT_MEMORY_TTL: Duration = Duration::from_secs(12);

pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Latest durable record for a name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedDomain {
    pub domain: String,
    pub cid: ContentId,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub auto_seed: bool,
}

/// Check that `name` is safe to use as a directory name
pub fn validate_name(name: &str) -> Result<(), ResolutionError> {
    let valid = !name.is_empty()
        && name.len() <= 253
        && !name.starts_with('.')
        && !name.ends_with('.')
        && !name.contains("..")
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(ResolutionError::InvalidName(name.to_string()))
    }
}

/// Append-only on-disk record of resolutions
pub struct DurableCache {
    dir: PathBuf,
    /// Serializes writers so version numbers stay monotonic
    write_lock: Mutex<()>,
}

impl DurableCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn name_dir(&self, name: &str) -> Result<PathBuf, GatewayError> {
        validate_name(name)?;
        Ok(self.dir.join(name))
    }

    /// Version numbers present for `name`, unsorted
    async fn versions(dir: &Path) -> std::io::Result<Vec<i64>> {
        let mut versions = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(VERSION_EXT) {
                continue;
            }
            if let Some(version) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i64>().ok())
            {
                versions.push(version);
            }
        }
        Ok(versions)
    }

    /// Latest record for `name`, if any
    pub async fn latest(&self, name: &str) -> Result<Option<CachedDomain>, GatewayError> {
        let dir = self.name_dir(name)?;
        let Some(version) = Self::versions(&dir)
            .await
            .map_err(|e| GatewayError::Configuration(format!("cache directory: {}", e)))?
            .into_iter()
            .max()
        else {
            return Ok(None);
        };

        let path = dir.join(format!("{}.{}", version, VERSION_EXT));
        let raw = fs::read_to_string(&path)
            .await
            .map_err(|e| GatewayError::Configuration(format!("read {}: {}", path.display(), e)))?;
        let cid = raw.trim().parse::<ContentId>().map_err(|e| {
            GatewayError::Configuration(format!("corrupt record {}: {}", path.display(), e))
        })?;

        Ok(Some(CachedDomain {
            domain: name.to_string(),
            cid,
            timestamp: version,
            auto_seed: fs::try_exists(dir.join(AUTO_SEED_MARKER)).await.unwrap_or(false),
        }))
    }

    /// Append a record unless `cid` equals the latest one.
    ///
    /// Returns whether a record was written.
    pub async fn save(&self, name: &str, cid: &ContentId) -> Result<bool, GatewayError> {
        let dir = self.name_dir(name)?;
        let _guard = self.write_lock.lock().await;

        if let Some(latest) = self.latest(name).await? {
            if latest.cid == *cid {
                return Ok(false);
            }
        }

        fs::create_dir_all(&dir)
            .await
            .map_err(|e| GatewayError::Configuration(format!("create {}: {}", dir.display(), e)))?;

        let newest = Self::versions(&dir).await.ok().and_then(|v| v.into_iter().max());
        let now = Utc::now().timestamp_millis();
        let version = match newest {
            Some(newest) if newest >= now => newest + 1,
            _ => now,
        };

        let path = dir.join(format!("{}.{}", version, VERSION_EXT));
        let tmp = dir.join(format!("{}.tmp", version));
        fs::write(&tmp, cid.to_string())
            .await
            .map_err(|e| GatewayError::Configuration(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| GatewayError::Configuration(format!("write {}: {}", path.display(), e)))?;

        info!(domain = name, cid = %cid, version, "Saved resolution");
        Ok(true)
    }

    /// Latest record of every cached name, sorted by name
    pub async fn list(&self) -> Result<Vec<CachedDomain>, GatewayError> {
        let mut domains = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(domains),
            Err(e) => return Err(GatewayError::Configuration(format!("cache directory: {}", e))),
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_name(&name).is_err() {
                continue;
            }
            match self.latest(&name).await {
                Ok(Some(domain)) => domains.push(domain),
                Ok(None) => {}
                Err(e) => warn!(domain = %name, error = %e, "Skipping unreadable cache entry"),
            }
        }

        domains.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(domains)
    }

    /// Names with auto-seeding enabled
    pub async fn seeded(&self) -> Result<Vec<CachedDomain>, GatewayError> {
        Ok(self.list().await?.into_iter().filter(|d| d.auto_seed).collect())
    }

    pub async fn set_auto_seed(&self, name: &str, enabled: bool) -> Result<(), GatewayError> {
        let marker = self.name_dir(name)?.join(AUTO_SEED_MARKER);
        let result = if enabled {
            fs::write(&marker, b"").await
        } else {
            match fs::remove_file(&marker).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        };
        result.map_err(|e| GatewayError::Configuration(format!("{}: {}", marker.display(), e)))
    }

    /// Delete every record for `name`, including the auto-seed marker
    pub async fn remove(&self, name: &str) -> Result<(), GatewayError> {
        let dir = self.name_dir(name)?;
        let _guard = self.write_lock.lock().await;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GatewayError::Configuration(format!(
                "remove {}: {}",
                dir.display(),
                e
            ))),
        }
    }
}

fn memory_capacity(entries: usize) -> NonZeroUsize {
    NonZeroUsize::new(entries).unwrap_or(NonZeroUsize::MIN)
}

struct MemoryEntry {
    cid: ContentId,
    stored_at: Instant,
}

/// Memory + durable resolution cache in front of a [`NameResolver`]
pub struct ResolutionCache {
    resolver: Arc<dyn NameResolver>,
    durable: DurableCache,
    memory: StdMutex<LruCache<String, MemoryEntry>>,
    memory_ttl: Duration,
    resolve_timeout: Duration,
}

impl ResolutionCache {
    pub fn new(
        resolver: Arc<dyn NameResolver>,
        durable: DurableCache,
        memory_ttl: Duration,
        resolve_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            durable,
            memory: StdMutex::new(LruCache::new(memory_capacity(DEFAULT_MEMORY_ENTRIES))),
            memory_ttl,
            resolve_timeout,
        }
    }

    /// Bound the memory tier to `entries` names
    pub fn with_memory_capacity(self, entries: usize) -> Self {
        lock_or_recover(&self.memory, "resolutions").resize(memory_capacity(entries));
        self
    }

    pub fn durable(&self) -> &DurableCache {
        &self.durable
    }

    pub fn resolver(&self) -> &Arc<dyn NameResolver> {
        &self.resolver
    }

    fn fresh(&self, name: &str) -> Option<ContentId> {
        let mut memory = lock_or_recover(&self.memory, "resolutions");
        let cached = memory.get(name).map(|entry| (entry.cid, entry.stored_at));
        match cached {
            Some((cid, stored_at)) if stored_at.elapsed() < self.memory_ttl => Some(cid),
            Some(_) => {
                memory.pop(name);
                None
            }
            None => None,
        }
    }

    /// Names currently held in the memory tier
    pub fn memory_len(&self) -> usize {
        lock_or_recover(&self.memory, "resolutions").len()
    }

    fn remember(&self, name: &str, cid: ContentId) {
        lock_or_recover(&self.memory, "resolutions").put(
            name.to_string(),
            MemoryEntry {
                cid,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop the memory entry for `name`
    pub fn forget(&self, name: &str) {
        lock_or_recover(&self.memory, "resolutions").pop(name);
    }

    /// Ask the resolver, bounded by the resolve timeout
    async fn ask_resolver(&self, name: &str) -> Result<ContentId, ResolutionError> {
        match tokio::time::timeout(self.resolve_timeout, self.resolver.resolve(name)).await {
            Ok(result) => result,
            Err(_) => Err(ResolutionError::Timeout(name.to_string())),
        }
    }

    /// Resolve `name`, serving the latest durable record if the resolver fails
    pub async fn resolve(&self, name: &str) -> Result<ContentId, ResolutionError> {
        validate_name(name)?;
        if let Some(cid) = self.fresh(name) {
            return Ok(cid);
        }

        match self.ask_resolver(name).await {
            Ok(cid) => {
                self.remember(name, cid);
                Ok(cid)
            }
            Err(err) => {
                if err.is_upstream_unavailable() {
                    warn!(domain = name, error = %err, "Resolver unavailable, trying durable cache");
                } else {
                    debug!(domain = name, error = %err, "Resolution failed, trying durable cache");
                }
                match self.durable.latest(name).await {
                    Ok(Some(record)) => {
                        info!(domain = name, cid = %record.cid, "Serving cached resolution");
                        self.remember(name, record.cid);
                        Ok(record.cid)
                    }
                    Ok(None) => Err(err),
                    Err(e) => {
                        warn!(domain = name, error = %e, "Durable cache unreadable");
                        Err(err)
                    }
                }
            }
        }
    }

    /// Resolve `name` through the resolver only, skipping both cache tiers.
    /// A successful answer still refreshes the memory tier.
    pub async fn refresh(&self, name: &str) -> Result<ContentId, ResolutionError> {
        validate_name(name)?;
        let cid = self.ask_resolver(name).await?;
        self.remember(name, cid);
        Ok(cid)
    }

    /// Persist `cid` for `name` if it differs from the latest record
    pub async fn save(&self, name: &str, cid: &ContentId) -> Result<bool, GatewayError> {
        self.durable.save(name, cid).await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Resolver answering from a map, with switchable outage
    #[derive(Default)]
    pub struct StaticResolver {
        pub answers: StdMutex<HashMap<String, Result<ContentId, ResolutionError>>>,
        pub down: AtomicBool,
        pub not_ready: AtomicBool,
        pub calls: AtomicUsize,
    }

    impl StaticResolver {
        pub fn set(&self, name: &str, cid: ContentId) {
            self.answers.lock().unwrap().insert(name.to_string(), Ok(cid));
        }

        pub fn set_err(&self, name: &str, err: ResolutionError) {
            self.answers.lock().unwrap().insert(name.to_string(), Err(err));
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NameResolver for StaticResolver {
        async fn resolve(&self, name: &str) -> Result<ContentId, ResolutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(ResolutionError::Unavailable("resolver offline".to_string()));
            }
            self.answers
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_else(|| Err(ResolutionError::NoResolver(name.to_string())))
        }

        fn ready(&self) -> bool {
            !self.not_ready.load(Ordering::SeqCst)
        }

        async fn wait_ready(&self) {
            while !self.ready() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    /// Resolver that never answers
    pub struct HangingResolver;

    #[async_trait]
    impl NameResolver for HangingResolver {
        async fn resolve(&self, _name: &str) -> Result<ContentId, ResolutionError> {
            std::future::pending().await
        }

        fn ready(&self) -> bool {
            true
        }

        async fn wait_ready(&self) {}
    }
}
