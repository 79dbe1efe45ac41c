//! Pending cache operations, keyed by content hash.
//!
//! At most one operation is pending per hash and a newer request replaces
//! the older one. A failed operation waits out its retry delay before it can
//! be taken again. The lock is held for a single map operation, never across
//! I/O.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use drover_cas::ContentHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Speculative warm-up; dropped when forced work arrives
    Idle,
    /// Needed by an active task or by maintenance
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOperation {
    pub hash: ContentHash,
    pub source: PathBuf,
    /// Expected size from the manifest (0 when unknown)
    pub size: u64,
    pub kind: OpKind,
    pub priority: Priority,
    /// Re-copy even when already cached
    pub force: bool,
}

impl CacheOperation {
    pub fn add(hash: ContentHash, source: impl Into<PathBuf>, size: u64, priority: Priority) -> Self {
        Self {
            hash,
            source: source.into(),
            size,
            kind: OpKind::Add,
            priority,
            force: false,
        }
    }

    pub fn remove(hash: ContentHash) -> Self {
        Self {
            hash,
            source: PathBuf::new(),
            size: 0,
            kind: OpKind::Remove,
            priority: Priority::Forced,
            force: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Debug)]
struct Pending {
    op: CacheOperation,
    /// Not taken before this instant
    retry_at: Option<Instant>,
}

impl Pending {
    fn ready(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Default)]
pub struct CacheQueue {
    pending: Mutex<HashMap<ContentHash, Pending>>,
}

impl CacheQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContentHash, Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert `op`, replacing whatever was pending for the same hash.
    pub fn enqueue(&self, op: CacheOperation) {
        self.lock().insert(op.hash, Pending { op, retry_at: None });
    }

    /// Put a failed operation back, not to be taken again for `delay`.
    ///
    /// Nothing is re-inserted when a newer request for the same hash arrived
    /// meanwhile, or when the operation is idle work and forced work is now
    /// waiting. Returns whether it was re-inserted.
    pub fn requeue(&self, op: CacheOperation, delay: Duration) -> bool {
        let mut pending = self.lock();
        if pending.contains_key(&op.hash) {
            return false;
        }
        if op.priority == Priority::Idle
            && pending.values().any(|p| p.op.priority == Priority::Forced)
        {
            return false;
        }
        pending.insert(
            op.hash,
            Pending {
                op,
                retry_at: Some(Instant::now() + delay),
            },
        );
        true
    }

    /// Remove and return an arbitrary operation that is not waiting out a
    /// retry delay.
    pub fn take(&self) -> Option<CacheOperation> {
        let now = Instant::now();
        let mut pending = self.lock();
        let hash = pending
            .iter()
            .find(|(_, p)| p.ready(now))
            .map(|(hash, _)| *hash)?;
        pending.remove(&hash).map(|p| p.op)
    }

    /// How long until [`take`](Self::take) can return something: `None` when
    /// the queue is empty, zero when an operation is ready now.
    pub fn next_ready_in(&self) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .values()
            .map(|p| p.retry_at.map_or(Duration::ZERO, |at| at.saturating_duration_since(now)))
            .min()
    }

    /// Drop every pending idle operation. Returns how many were dropped.
    pub fn drop_idle(&self) -> usize {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|_, p| p.op.priority != Priority::Idle);
        before - pending.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn forced_len(&self) -> usize {
        self.lock()
            .values()
            .filter(|p| p.op.priority == Priority::Forced)
            .count()
    }

    pub fn pending(&self, hash: &ContentHash) -> Option<CacheOperation> {
        self.lock().get(hash).map(|p| p.op.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> ContentHash {
        ContentHash::from_bytes([n; 20])
    }

    #[test]
    fn test_newer_request_replaces_older() {
        let queue = CacheQueue::new();
        queue.enqueue(CacheOperation::add(hash(1), "/a", 10, Priority::Idle));
        queue.enqueue(CacheOperation::remove(hash(1)));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending(&hash(1)).unwrap().kind, OpKind::Remove);
    }

    #[test]
    fn test_requeue_keeps_newer_request() {
        let queue = CacheQueue::new();
        let failed = CacheOperation::add(hash(1), "/a", 10, Priority::Forced);
        queue.enqueue(CacheOperation::remove(hash(1)));

        assert!(!queue.requeue(failed.clone(), Duration::ZERO));
        assert_eq!(queue.pending(&hash(1)).unwrap().kind, OpKind::Remove);

        queue.take();
        assert!(queue.requeue(failed.clone(), Duration::ZERO));
        assert_eq!(queue.pending(&hash(1)), Some(failed));
    }

    #[test]
    fn test_requeued_operation_waits_out_delay() {
        let queue = CacheQueue::new();
        let failed = CacheOperation::add(hash(1), "/a", 10, Priority::Forced);
        assert!(queue.requeue(failed.clone(), Duration::from_secs(60)));
        queue.enqueue(CacheOperation::add(hash(2), "/b", 10, Priority::Forced));

        assert_eq!(queue.take().unwrap().hash, hash(2));
        assert!(queue.take().is_none());
        assert_eq!(queue.len(), 1);
        let wait = queue.next_ready_in().unwrap();
        assert!(wait > Duration::from_secs(50), "{:?}", wait);

        // A fresh request for the same hash is ready at once.
        queue.enqueue(failed);
        assert_eq!(queue.next_ready_in(), Some(Duration::ZERO));
        assert_eq!(queue.take().unwrap().hash, hash(1));
        assert_eq!(queue.next_ready_in(), None);
    }

    #[test]
    fn test_failed_idle_work_dropped_once_forced_arrives() {
        let queue = CacheQueue::new();
        queue.enqueue(CacheOperation::add(hash(1), "/a", 1, Priority::Idle));
        queue.enqueue(CacheOperation::add(hash(2), "/b", 1, Priority::Idle));
        let in_flight = queue.take().unwrap();

        // Forced work arrives while the idle operation is being processed.
        queue.drop_idle();
        queue.enqueue(CacheOperation::add(hash(3), "/c", 1, Priority::Forced));

        assert!(!queue.requeue(in_flight.clone(), Duration::ZERO));
        assert!(queue.pending(&in_flight.hash).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.forced_len(), 1);

        // Without forced work waiting, failed idle work is kept.
        queue.take();
        assert!(queue.requeue(in_flight.clone(), Duration::ZERO));
        assert_eq!(queue.pending(&in_flight.hash), Some(in_flight));
    }

    #[test]
    fn test_drop_idle_keeps_forced() {
        let queue = CacheQueue::new();
        queue.enqueue(CacheOperation::add(hash(1), "/a", 1, Priority::Idle));
        queue.enqueue(CacheOperation::add(hash(2), "/b", 1, Priority::Idle));
        queue.enqueue(CacheOperation::add(hash(3), "/c", 1, Priority::Forced));

        assert_eq!(queue.forced_len(), 1);
        assert_eq!(queue.drop_idle(), 2);
        assert_eq!(queue.len(), 1);
        assert!(queue.pending(&hash(3)).is_some());
    }

    #[test]
    fn test_take_drains() {
        let queue = CacheQueue::new();
        queue.enqueue(CacheOperation::add(hash(1), "/a", 1, Priority::Idle));
        queue.enqueue(CacheOperation::remove(hash(2)));

        let mut taken = vec![queue.take().unwrap().hash, queue.take().unwrap().hash];
        taken.sort();
        assert_eq!(taken, vec![hash(1), hash(2)]);
        assert!(queue.take().is_none());
        assert!(queue.is_empty());
    }
}
