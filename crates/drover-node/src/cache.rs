use std::path::Path;
use std::sync::Arc;

use drover_cas::{ContentHash, ContentStore};
use drover_config::log_worker_debug;

use crate::queue::{CacheOperation, CacheQueue, Priority};
use crate::registry::ManifestEntry;

/// Public request surface of the cache.
///
/// Requests only touch the queue; they never block on I/O and never fail.
/// The worker loop carries them out.
#[derive(Debug, Clone)]
pub struct CacheService {
    store: ContentStore,
    queue: Arc<CacheQueue>,
}

impl CacheService {
    pub fn new(store: ContentStore, queue: Arc<CacheQueue>) -> Self {
        Self { store, queue }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn queue(&self) -> &Arc<CacheQueue> {
        &self.queue
    }

    /// Ask for every file of a build to be cached.
    ///
    /// A forced request first throws away all pending idle work, so files an
    /// active task needs are not stuck behind speculative precache.
    pub fn request_build(
        &self,
        manifest: &[ManifestEntry],
        repository_root: &Path,
        priority: Priority,
    ) {
        if priority == Priority::Forced {
            let dropped = self.queue.drop_idle();
            if dropped > 0 {
                log_worker_debug!(dropped, "Dropped idle requests for forced build");
            }
        }
        for entry in manifest {
            self.queue.enqueue(CacheOperation::add(
                entry.hash,
                repository_root.join(&entry.path),
                entry.size,
                priority,
            ));
        }
    }

    /// `true` if `hash` is cached. Otherwise a forced add is queued and the
    /// caller polls again later.
    pub fn request_availability(&self, hash: &ContentHash, source: &Path) -> bool {
        if self.store.contains(hash) {
            return true;
        }
        self.queue
            .enqueue(CacheOperation::add(*hash, source, 0, Priority::Forced));
        false
    }

    pub fn request_removal(&self, hash: &ContentHash) {
        self.queue.enqueue(CacheOperation::remove(*hash));
    }

    /// Re-copy `hash` from `source` even if it is already cached.
    pub fn request_recache(&self, hash: &ContentHash, source: &Path, size: u64) {
        self.queue.enqueue(
            CacheOperation::add(*hash, source, size, Priority::Forced).forced(),
        );
    }
}
