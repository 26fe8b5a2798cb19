//! Auto-seeding reconciler.
//!
//! Names marked for auto-seeding are re-resolved on a fixed interval. When a
//! name points at new content, the new content is copied into the cache
//! location, pinned, and recorded. Previous content stays pinned; clearing a
//! name's cache is the only way to release it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::content_store::ContentStore;
use crate::error::GatewayError;
use crate::resolution_cache::{CachedDomain, ResolutionCache};

pub const DEFAULT_SEED_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Upper bound on simultaneously seeded names
pub const DEFAULT_MAX_SEEDED: usize = 100;

/// How long shutdown waits for an in-flight pass before abandoning it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Keeps auto-seeded names pinned at their current content
pub struct AutoSeeder {
    cache: Arc<ResolutionCache>,
    store: Arc<dyn ContentStore>,
    max_seeded: usize,
    running: AtomicBool,
}

/// Clears the running flag when a cycle ends, even by panic
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl AutoSeeder {
    pub fn new(cache: Arc<ResolutionCache>, store: Arc<dyn ContentStore>, max_seeded: usize) -> Self {
        Self {
            cache,
            store,
            max_seeded,
            running: AtomicBool::new(false),
        }
    }

    /// Mark `domain` for auto-seeding.
    ///
    /// The name must already have a cached resolution, and its content must
    /// be pinnable; the flag is only written once the pin succeeded.
    pub async fn enable(&self, domain: &str) -> Result<CachedDomain, GatewayError> {
        let durable = self.cache.durable();
        let record = durable.latest(domain).await?.ok_or_else(|| {
            GatewayError::BadRequest(format!("{} has no cached resolution", domain))
        })?;
        if record.auto_seed {
            return Ok(record);
        }

        let seeded = durable.seeded().await?.len();
        if seeded >= self.max_seeded {
            return Err(GatewayError::BadRequest(format!(
                "auto-seeding is limited to {} names",
                self.max_seeded
            )));
        }

        self.store.pin(&record.cid, true).await?;
        if let Err(e) = self.store.copy_to_cache(&record.cid).await {
            warn!(domain, error = %e, "Failed to copy seeded content to cache");
        }
        durable.set_auto_seed(domain, true).await?;

        info!(domain, cid = %record.cid, "Auto-seeding enabled");
        Ok(CachedDomain {
            auto_seed: true,
            ..record
        })
    }

    /// Stop auto-seeding `domain`. The unpin is best-effort; the cached
    /// resolution is kept.
    pub async fn disable(&self, domain: &str) -> Result<(), GatewayError> {
        let durable = self.cache.durable();
        if let Some(record) = durable.latest(domain).await? {
            if let Err(e) = self.store.unpin(&record.cid).await {
                warn!(domain, cid = %record.cid, error = %e, "Failed to unpin");
            }
        }
        durable.set_auto_seed(domain, false).await?;
        info!(domain, "Auto-seeding disabled");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one reconciliation pass. Returns `None` when a pass is already
    /// in progress.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Auto-seed cycle already running, skipping trigger");
            return None;
        }
        let _guard = CycleGuard(&self.running);

        let mut report = CycleReport::default();
        let seeded = match self.cache.durable().seeded().await {
            Ok(seeded) => seeded,
            Err(e) => {
                warn!(error = %e, "Failed to list auto-seeded names");
                return Some(report);
            }
        };

        for record in seeded {
            report.checked += 1;
            match self.reconcile(&record).await {
                Ok(true) => report.updated += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(domain = %record.domain, error = %e, "Auto-seed check failed");
                }
            }
        }

        info!(
            checked = report.checked,
            updated = report.updated,
            failed = report.failed,
            "Auto-seed cycle finished"
        );
        Some(report)
    }

    /// Bring one name up to date; returns whether its content changed
    async fn reconcile(&self, record: &CachedDomain) -> Result<bool, GatewayError> {
        let current = self.cache.refresh(&record.domain).await?;
        if current == record.cid {
            debug!(domain = %record.domain, "Auto-seeded content unchanged");
            return Ok(false);
        }

        info!(domain = %record.domain, old = %record.cid, new = %current, "Content changed");
        self.store.copy_to_cache(&current).await?;
        self.store.pin(&current, true).await?;
        self.cache.save(&record.domain, &current).await?;
        Ok(true)
    }

    /// Run passes every `period`, the first one immediately, until
    /// `shutdown` flips to true. A pass still in flight at shutdown gets
    /// a bounded grace period to finish.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("Starting auto-seeder with {}s interval", period.as_secs());

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pass: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if pass.as_ref().is_some_and(|p| !p.is_finished()) {
                        debug!("Previous auto-seed pass still running");
                        continue;
                    }
                    let seeder = Arc::clone(&self);
                    pass = Some(tokio::spawn(async move {
                        seeder.run_cycle().await;
                    }));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(mut pass) = pass {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut pass).await {
                Ok(Err(e)) => warn!("Auto-seed pass ended abnormally: {}", e),
                Ok(Ok(())) => {}
                Err(_) => {
                    warn!(
                        "Auto-seed pass still running after {}s, abandoning it",
                        SHUTDOWN_GRACE.as_secs()
                    );
                    pass.abort();
                }
            }
        }
        info!("Auto-seeder stopped");
    }
}
