//! Periodic cache upkeep: orphan reclamation, size-based eviction and idle
//! precache of recent builds.
//!
//! Maintenance never touches the store itself. It reads the index, asks the
//! registry, and queues work for the cache worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use drover_cas::ContentHash;
use drover_config::{log_maint_debug, log_maint_info};
use rand::seq::IteratorRandom;
use tokio::sync::watch;

use crate::alert::ErrorReporter;
use crate::cache::CacheService;
use crate::client::RegistryClient;
use crate::queue::{OpKind, Priority};

#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    pub interval: Duration,
    pub orphan_sample_size: usize,
    pub precache_builds: usize,
    /// Disk budget in bytes
    pub size_limit: u64,
}

/// What one pass queued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Reclamation and eviction were skipped because work was in flight
    pub busy: bool,
    pub orphans: usize,
    pub evicted: usize,
    pub evicted_bytes: u64,
    pub precached_builds: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub hash: ContentHash,
    pub size: u64,
    pub last_access: SystemTime,
}

/// Oldest-first prefix of `candidates` whose removal brings `total` down to
/// `limit` or below. Empty when already within budget.
pub fn plan_eviction(
    mut candidates: Vec<EvictionCandidate>,
    total: u64,
    limit: u64,
) -> Vec<EvictionCandidate> {
    if total <= limit {
        return Vec::new();
    }
    candidates.sort_by(|a, b| {
        a.last_access
            .cmp(&b.last_access)
            .then_with(|| a.hash.cmp(&b.hash))
    });

    let mut remaining = total;
    let mut plan = Vec::new();
    for candidate in candidates {
        if remaining <= limit {
            break;
        }
        remaining = remaining.saturating_sub(candidate.size);
        plan.push(candidate);
    }
    plan
}

#[derive(Debug, Clone)]
pub struct Maintenance {
    cache: CacheService,
    registry: RegistryClient,
    /// Executions running on this node
    active: Arc<AtomicUsize>,
    settings: MaintenanceSettings,
}

impl Maintenance {
    pub fn new(
        cache: CacheService,
        registry: RegistryClient,
        active: Arc<AtomicUsize>,
        settings: MaintenanceSettings,
    ) -> Self {
        Self {
            cache,
            registry,
            active,
            settings,
        }
    }

    /// Check a random sample of cached hashes against the registry and queue
    /// removal of the ones no build references.
    pub fn reclaim_orphans(&self) -> usize {
        let mut rng = rand::thread_rng();
        let sample = self
            .cache
            .store()
            .hashes()
            .into_iter()
            .choose_multiple(&mut rng, self.settings.orphan_sample_size);

        let referenced = self.registry.hashes_still_referenced(&sample);
        let mut orphans = 0;
        for (hash, referenced) in sample.iter().zip(referenced) {
            if !referenced {
                log_maint_debug!(%hash, "Unreferenced file queued for removal");
                self.cache.request_removal(hash);
                orphans += 1;
            }
        }
        orphans
    }

    /// Queue removal of least recently used files until the cache fits the
    /// budget. Returns (files, bytes) queued.
    pub fn evict(&self) -> (usize, u64) {
        let store = self.cache.store();
        let total = store.total_size();
        if total <= self.settings.size_limit {
            return (0, 0);
        }

        let queue = self.cache.queue();
        let mut pending_bytes = 0;
        let mut candidates = Vec::new();
        for (hash, size) in store.snapshot() {
            if queue
                .pending(&hash)
                .is_some_and(|op| op.kind == OpKind::Remove)
            {
                pending_bytes += size;
                continue;
            }
            // Unreadable metadata sorts as oldest.
            let last_access = store.last_access(&hash).unwrap_or(SystemTime::UNIX_EPOCH);
            candidates.push(EvictionCandidate {
                hash,
                size,
                last_access,
            });
        }

        let plan = plan_eviction(
            candidates,
            total.saturating_sub(pending_bytes),
            self.settings.size_limit,
        );
        let bytes = plan.iter().map(|c| c.size).sum();
        for candidate in &plan {
            self.cache.request_removal(&candidate.hash);
        }
        if !plan.is_empty() {
            log_maint_info!(
                files = plan.len(),
                bytes,
                total,
                limit = self.settings.size_limit,
                "Evicting least recently used files"
            );
        }
        (plan.len(), bytes)
    }

    /// Queue the newest ready builds at idle priority.
    pub fn precache_idle(&self) -> usize {
        let store = self.cache.store();
        let mut requested = 0;
        for build in self
            .registry
            .recent_ready_builds(self.settings.precache_builds)
        {
            let missing: Vec<_> = self
                .registry
                .build_manifest(build)
                .into_iter()
                .filter(|entry| !store.contains(&entry.hash))
                .collect();
            if missing.is_empty() {
                continue;
            }
            let root = self.registry.repository_root(build);
            log_maint_debug!(build, files = missing.len(), "Precaching build");
            self.cache.request_build(&missing, &root, Priority::Idle);
            requested += 1;
        }
        requested
    }

    /// One maintenance pass.
    pub fn tick(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let queue = self.cache.queue();

        let no_tasks = self.active.load(Ordering::SeqCst) == 0
            && self.registry.active_task_count() == 0;
        if !no_tasks || !queue.is_empty() {
            report.busy = true;
        } else {
            report.orphans = self.reclaim_orphans();
            (report.evicted, report.evicted_bytes) = self.evict();
        }

        // Also skipped when this pass just queued removals.
        if no_tasks && queue.is_empty() {
            report.precached_builds = self.precache_idle();
        }

        log_maint_info!(
            busy = report.busy,
            orphans = report.orphans,
            evicted = report.evicted,
            precached_builds = report.precached_builds,
            "Maintenance pass finished"
        );
        report
    }

    pub async fn run(self, reporter: Arc<ErrorReporter>, mut shutdown: watch::Receiver<bool>) {
        log_maint_info!(
            interval_secs = self.settings.interval.as_secs(),
            "Maintenance loop started"
        );
        loop {
            let pause = match tokio::task::spawn_blocking({
                let this = self.clone();
                move || this.tick()
            })
            .await
            {
                Ok(_) => self.settings.interval,
                Err(e) => reporter.report("MAINT", &e),
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log_maint_info!("Maintenance loop stopped");
    }
}
